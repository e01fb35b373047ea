// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network isolation for instances.
//!
//! Two engines implement [`FirewallDriver`]: [`ChainFilter`] programs
//! iptables chains on the host and [`FilterGraph`] registers filter objects
//! with the hypervisor. Per instance, both follow the same lifecycle:
//! basic filtering, then prepare, then apply, and finally unfilter.

use std::sync::Arc;

use async_trait::async_trait;
use slog::Logger;
use stratus_config::{Config, FirewallKind};
use thiserror::Error;

use crate::cidr::CidrError;
use crate::exec::{ExecError, ProcessRunner};
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::instance::{Instance, NetworkInfo};

pub mod chain;
pub mod graph;
pub mod iptables;
pub mod store;

pub use chain::ChainFilter;
pub use graph::{FilterGraph, FilterObject};
pub use store::{
    Protocol, ProviderRule, SecurityGroupRule, SecurityGroupStore, StoreError,
};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("filter {filter} references {missing}, which is not registered")]
    MissingDependency { filter: String, missing: String },

    #[error("malformed iptables-save output for table {0}")]
    MalformedSave(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirewallDriver: Send + Sync {
    /// Computes the instance's rules without touching live state.
    async fn prepare_instance_filter(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError>;

    /// Commits whatever `prepare_instance_filter` computed.
    async fn apply_instance_filter(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError>;

    async fn unfilter_instance(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError>;

    /// Installs anti-spoofing filters so the domain can be defined.
    async fn setup_basic_filtering(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError>;

    async fn refresh_security_group_rules(
        &self,
        security_group_id: u64,
    ) -> Result<(), FirewallError>;

    async fn refresh_security_group_members(
        &self,
        security_group_id: u64,
    ) -> Result<(), FirewallError>;

    async fn refresh_provider_fw_rules(&self) -> Result<(), FirewallError>;

    async fn instance_filter_exists(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<bool, FirewallError>;
}

/// Builds the engine selected by the configuration.
pub fn new_driver(
    config: &Config,
    hypervisor: Arc<dyn Hypervisor>,
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn SecurityGroupStore>,
    log: &Logger,
) -> Box<dyn FirewallDriver> {
    match config.firewall.driver {
        FirewallKind::Iptables => {
            Box::new(ChainFilter::new(config, hypervisor, runner, store, log))
        }
        FirewallKind::Nwfilter => {
            Box::new(FilterGraph::new(config, hypervisor, store, log))
        }
    }
}

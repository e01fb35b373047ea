// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor management capability the driver is written against.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::ExecError;
use crate::firewall::FilterObject;
use crate::instance::PowerState;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("domain {0} not found")]
    DomainNotFound(String),

    #[error("filter {0} not found")]
    FilterNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("disk {disk} not attached to {domain}")]
    DiskNotFound { domain: String, disk: String },

    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("hypervisor I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

bitflags::bitflags! {
    /// Migration behaviour flags, numbered as the management layer
    /// numbers them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        const LIVE = 1 << 0;
        const PEER2PEER = 1 << 1;
        const TUNNELLED = 1 << 2;
        const PERSIST_DEST = 1 << 3;
        const UNDEFINE_SOURCE = 1 << 4;
        const PAUSED = 1 << 5;
        const NON_SHARED_DISK = 1 << 6;
        const NON_SHARED_INC = 1 << 7;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown migration flag {0:?}")]
pub struct UnknownFlag(pub String);

impl MigrateFlags {
    /// Combines flag names of the form `VIR_MIGRATE_PEER2PEER`.
    pub fn from_names<I, S>(names: I) -> Result<Self, UnknownFlag>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(MigrateFlags::empty(), |acc, name| {
            let name = name.as_ref().trim();
            let short = name.strip_prefix("VIR_MIGRATE_").unwrap_or(name);
            MigrateFlags::from_name(short)
                .map(|flag| acc | flag)
                .ok_or_else(|| UnknownFlag(name.to_string()))
        })
    }
}

/// A disk attached to a defined domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainDisk {
    /// `file`, `block` or `network`.
    pub kind: String,
    pub target: String,
    pub source: Option<String>,
    /// Image format, when the management layer reports it.
    pub driver_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub arch: String,
    pub model: String,
    pub vendor: String,
    pub topology: CpuTopology,
    pub features: Vec<String>,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define_domain(&self, descriptor: &str) -> Result<(), HypervisorError>;
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// `None` when no domain by that name is defined.
    async fn domain_state(
        &self,
        name: &str,
    ) -> Result<Option<PowerState>, HypervisorError>;
    async fn domain_descriptor(&self, name: &str) -> Result<String, HypervisorError>;
    async fn domain_disks(
        &self,
        name: &str,
    ) -> Result<Vec<DomainDisk>, HypervisorError>;
    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError>;

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn has_managed_save(&self, name: &str) -> Result<bool, HypervisorError>;
    async fn remove_managed_save(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;

    async fn attach_device(
        &self,
        name: &str,
        stanza: &str,
    ) -> Result<(), HypervisorError>;
    async fn detach_disk(
        &self,
        name: &str,
        target: &str,
    ) -> Result<(), HypervisorError>;

    async fn migrate_to_uri(
        &self,
        name: &str,
        uri: &str,
        flags: MigrateFlags,
        bandwidth: u64,
    ) -> Result<(), HypervisorError>;

    async fn define_filter(&self, filter: &FilterObject) -> Result<(), HypervisorError>;
    async fn undefine_filter(&self, name: &str) -> Result<(), HypervisorError>;
    async fn filter_exists(&self, name: &str) -> Result<bool, HypervisorError>;

    async fn hypervisor_type(&self) -> Result<String, HypervisorError>;
    async fn hypervisor_version(&self) -> Result<u64, HypervisorError>;
    async fn cpu_info(&self) -> Result<CpuInfo, HypervisorError>;
    /// Virtual CPUs assigned across all running domains.
    async fn vcpus_used(&self) -> Result<u32, HypervisorError>;
}

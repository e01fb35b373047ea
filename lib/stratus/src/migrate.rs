// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration of a domain to another host.
//!
//! The destination prepares volumes and firewall filters, the source
//! triggers the hypervisor-level migration, and the caller's
//! [`MigrationRecovery`] is told how it ended.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::{error, info, warn, Logger};
use stratus_config::Config;
use thiserror::Error;

use crate::firewall::{FirewallDriver, FirewallError};
use crate::hypervisor::{Hypervisor, HypervisorError, MigrateFlags, UnknownFlag};
use crate::instance::{strip_dev, BlockDeviceInfo, Instance, NetworkInfo};
use crate::volume::{VolumeDriverRegistry, VolumeError};

const COMPLETION_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Timeout migrating for {0}. nwfilter not found.")]
    FilterTimeout(String),

    #[error("invalid migration flags: {0}")]
    Flags(#[from] UnknownFlag),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

#[derive(Debug, Error)]
#[error("migration recovery failed: {0}")]
pub struct RecoveryError(pub String);

/// Everything needed to finish or undo one migration.
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationRequest {
    pub context: String,
    pub instance: Instance,
    pub dest: String,
    pub block_migration: bool,
}

/// Caller hooks run once the outcome of a migration is known.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MigrationRecovery: Send + Sync {
    /// The source domain is gone; the instance now lives on `dest`.
    async fn post_live_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<(), RecoveryError>;

    /// The hypervisor refused or aborted the migration.
    async fn rollback_live_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<(), RecoveryError>;
}

/// A migration trigger that failed, with the request still attached.
#[derive(Debug)]
pub struct TriggerFailure {
    pub request: MigrationRequest,
    pub source: HypervisorError,
}

pub struct MigrationOrchestrator {
    uri_template: String,
    bandwidth: u64,
    flags: MigrateFlags,
    block_flags: MigrateFlags,
    retry_count: u32,
    retry_interval: Duration,
    hypervisor: Arc<dyn Hypervisor>,
    volumes: Arc<VolumeDriverRegistry>,
    log: Logger,
}

impl MigrationOrchestrator {
    pub fn new(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
        volumes: Arc<VolumeDriverRegistry>,
        log: &Logger,
    ) -> Result<Self, MigrateError> {
        let migration = &config.migration;
        Ok(Self {
            uri_template: migration.uri.clone(),
            bandwidth: migration.bandwidth,
            flags: MigrateFlags::from_names(&migration.flags)?,
            block_flags: MigrateFlags::from_names(&migration.block_flags)?,
            retry_count: migration.retry_count,
            retry_interval: Duration::from_secs(migration.retry_interval_secs),
            hypervisor,
            volumes,
            log: log.new(slog::o!("component" => "migration")),
        })
    }

    pub fn destination_uri(&self, dest: &str) -> String {
        self.uri_template.replace("%s", dest)
    }

    /// Reconnects every attached volume on this (destination) host.
    pub async fn pre_live_migration(
        &self,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<(), MigrateError> {
        let Some(info) = block_device_info else {
            return Ok(());
        };
        for vol in &info.block_device_mapping {
            self.volumes
                .connect_volume(&vol.connection_info, strip_dev(&vol.mount_device))
                .await?;
        }
        Ok(())
    }

    /// Sets up the instance's filters on this host and waits for the
    /// firewall to report them.
    ///
    /// The filter is checked `retry_count` times with `retry_interval`
    /// between checks, so the total wait is `retry_count - 1` intervals.
    pub async fn ensure_filtering_rules_for_instance(
        &self,
        firewall: &dyn FirewallDriver,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), MigrateError> {
        firewall.setup_basic_filtering(instance, network_info).await?;
        firewall.prepare_instance_filter(instance, network_info).await?;

        for attempt in 1..=self.retry_count {
            if firewall.instance_filter_exists(instance, network_info).await? {
                return Ok(());
            }
            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        warn!(self.log, "instance filter never appeared"; "instance" => &instance.name);
        Err(MigrateError::FilterTimeout(instance.name.clone()))
    }

    async fn trigger(
        &self,
        request: MigrationRequest,
    ) -> Result<MigrationRequest, TriggerFailure> {
        let flags = if request.block_migration {
            self.block_flags
        } else {
            self.flags
        };
        let uri = self.destination_uri(&request.dest);
        info!(self.log, "starting live migration";
            "instance" => &request.instance.name, "uri" => &uri,
            "flags" => flags.bits());
        match self
            .hypervisor
            .migrate_to_uri(&request.instance.name, &uri, flags, self.bandwidth)
            .await
        {
            Ok(()) => Ok(request),
            Err(source) => Err(TriggerFailure { request, source }),
        }
    }

    /// Migrates the instance to `request.dest`.
    ///
    /// A failed trigger is never retried: the request is handed to
    /// `rollback_live_migration` and the hypervisor error is returned.
    /// Otherwise the source domain is polled until it disappears and then
    /// `post_live_migration` runs.
    pub async fn live_migration(
        &self,
        request: MigrationRequest,
        recovery: &dyn MigrationRecovery,
    ) -> Result<(), MigrateError> {
        let request = match self.trigger(request).await {
            Ok(request) => request,
            Err(TriggerFailure { request, source }) => {
                error!(self.log, "live migration failed";
                    "instance" => &request.instance.name, "error" => %source);
                if let Err(e) = recovery.rollback_live_migration(&request).await {
                    error!(self.log, "rollback failed";
                        "instance" => &request.instance.name, "error" => %e);
                }
                return Err(MigrateError::Hypervisor(source));
            }
        };

        while self.hypervisor.domain_state(&request.instance.name).await?.is_some() {
            tokio::time::sleep(COMPLETION_POLL).await;
        }
        info!(self.log, "source domain gone"; "instance" => &request.instance.name);
        recovery.post_live_migration(&request).await?;
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host capacity sampling and the compute-node record it feeds.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use slog::{info, Logger};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::hypervisor::{CpuInfo, HypervisorError};

#[derive(Debug, Error)]
pub enum HostStateError {
    #[error("no compute service is registered for host {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("host sampling failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unparseable host data: {0}")]
    Parse(String),

    #[error("capacity store: {0}")]
    Store(String),
}

/// Raw capacity counters for the host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapacitySource: Send + Sync {
    async fn vcpu_total(&self) -> Result<u32, HostStateError>;
    async fn vcpu_used(&self) -> Result<u32, HostStateError>;
    async fn memory_mb_total(&self) -> Result<u64, HostStateError>;
    async fn memory_mb_used(&self) -> Result<u64, HostStateError>;
    async fn local_gb_total(&self) -> Result<u64, HostStateError>;
    async fn local_gb_used(&self) -> Result<u64, HostStateError>;
    async fn hypervisor_type(&self) -> Result<String, HostStateError>;
    async fn hypervisor_version(&self) -> Result<u64, HostStateError>;
    async fn cpu_info(&self) -> Result<CpuInfo, HostStateError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub vcpus: u32,
    pub vcpus_used: u32,
    pub cpu_info: CpuInfo,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_available: u64,
    pub host_memory_total: u64,
    pub host_memory_free: u64,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    pub id: u64,
    pub compute_node_id: Option<u64>,
}

/// The per-host capacity record kept by the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub service_id: u64,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub local_gb: u64,
    pub vcpus_used: u32,
    pub memory_mb_used: u64,
    pub local_gb_used: u64,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    /// JSON rendering of [`CpuInfo`].
    pub cpu_info: String,
}

#[async_trait]
pub trait CapacityStore: Send + Sync {
    async fn service_for_host(
        &self,
        host: &str,
    ) -> Result<Option<ServiceRecord>, HostStateError>;
    async fn create_compute_node(&self, node: &ComputeNode) -> Result<u64, HostStateError>;
    async fn update_compute_node(
        &self,
        id: u64,
        node: &ComputeNode,
    ) -> Result<(), HostStateError>;
}

pub struct HostStateReporter {
    stats: Mutex<Option<HostStats>>,
    log: Logger,
}

impl HostStateReporter {
    pub fn new(log: &Logger) -> Self {
        Self {
            stats: Mutex::new(None),
            log: log.new(slog::o!("component" => "host-state")),
        }
    }

    pub async fn sample(
        &self,
        source: &dyn CapacitySource,
    ) -> Result<HostStats, HostStateError> {
        let disk_total = source.local_gb_total().await?;
        let disk_used = source.local_gb_used().await?;
        let memory_total = source.memory_mb_total().await?;
        let memory_used = source.memory_mb_used().await?;
        Ok(HostStats {
            vcpus: source.vcpu_total().await?,
            vcpus_used: source.vcpu_used().await?,
            cpu_info: source.cpu_info().await?,
            disk_total,
            disk_used,
            disk_available: disk_total.saturating_sub(disk_used),
            host_memory_total: memory_total,
            host_memory_free: memory_total.saturating_sub(memory_used),
            hypervisor_type: source.hypervisor_type().await?,
            hypervisor_version: source.hypervisor_version().await?,
        })
    }

    /// Last sampled statistics, sampling first if asked to or if nothing
    /// has been sampled yet.
    pub async fn get_host_stats(
        &self,
        source: &dyn CapacitySource,
        refresh: bool,
    ) -> Result<HostStats, HostStateError> {
        let mut stats = self.stats.lock().await;
        if let (false, Some(cached)) = (refresh, stats.as_ref()) {
            return Ok(cached.clone());
        }
        let fresh = self.sample(source).await?;
        *stats = Some(fresh.clone());
        Ok(fresh)
    }

    /// Writes current capacity into the compute-node record for `host`.
    pub async fn update_available_resource(
        &self,
        source: &dyn CapacitySource,
        store: &dyn CapacityStore,
        host: &str,
    ) -> Result<(), HostStateError> {
        let service = store
            .service_for_host(host)
            .await?
            .ok_or_else(|| HostStateError::ServiceUnavailable(host.to_string()))?;

        let cpu_info = source.cpu_info().await?;
        let node = ComputeNode {
            service_id: service.id,
            vcpus: source.vcpu_total().await?,
            memory_mb: source.memory_mb_total().await?,
            local_gb: source.local_gb_total().await?,
            vcpus_used: source.vcpu_used().await?,
            memory_mb_used: source.memory_mb_used().await?,
            local_gb_used: source.local_gb_used().await?,
            hypervisor_type: source.hypervisor_type().await?,
            hypervisor_version: source.hypervisor_version().await?,
            cpu_info: serde_json::to_string(&cpu_info)
                .map_err(|e| HostStateError::Parse(e.to_string()))?,
        };

        match service.compute_node_id {
            Some(id) => store.update_compute_node(id, &node).await?,
            None => {
                let id = store.create_compute_node(&node).await?;
                info!(self.log, "registered compute node"; "host" => host, "id" => id);
            }
        }
        Ok(())
    }
}

/// Total and used memory in MiB from `/proc/meminfo` text. Buffers and
/// page cache count as free.
pub fn parse_meminfo(text: &str) -> Result<(u64, u64), HostStateError> {
    let field = |name: &str| -> Result<u64, HostStateError> {
        text.lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == name)
                    .then(|| value.split_whitespace().next()?.parse::<u64>().ok())
                    .flatten()
            })
            .ok_or_else(|| HostStateError::Parse(format!("meminfo lacks {name}")))
    };
    let total = field("MemTotal")?;
    let free = field("MemFree")? + field("Buffers")? + field("Cached")?;
    Ok((total / 1024, total.saturating_sub(free) / 1024))
}

/// Total and used bytes of the filesystem holding `path`.
pub fn filesystem_usage(path: &Path) -> Result<(u64, u64), HostStateError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| HostStateError::Parse(e.to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // Safety: `c_path` is NUL-terminated and `stat` is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let frsize = stat.f_frsize as u64;
    let total = frsize * stat.f_blocks as u64;
    let available = frsize * stat.f_bavail as u64;
    Ok((total, total.saturating_sub(available)))
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records handed to the driver by the control plane.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// Power state of a domain as reported by the hypervisor.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    pub image_ref: String,
    #[serde(default)]
    pub kernel_id: Option<String>,
    #[serde(default)]
    pub ramdisk_id: Option<String>,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub local_gb: u64,
    #[serde(default)]
    pub swap_mb: u64,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub power_state: PowerState,
}

impl Instance {
    /// The hypervisor-facing name for an instance id.
    pub fn name_for(id: u64) -> String {
        format!("instance-{id:08x}")
    }

    pub fn memory_kib(&self) -> u64 {
        self.memory_mb * 1024
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub bridge: String,
    pub cidr: String,
    #[serde(default)]
    pub cidr_v6: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedIp {
    pub ip: String,
    #[serde(default)]
    pub netmask: Option<String>,
}

/// Per-interface details for one attachment to a network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub mac: String,
    #[serde(default)]
    pub ips: Vec<FixedIp>,
    #[serde(default)]
    pub ip6s: Vec<FixedIp>,
    /// Also acts as the DHCP server for the interface.
    pub gateway: String,
    #[serde(default)]
    pub gateway6: Option<String>,
}

impl Mapping {
    /// MAC address with separators removed, used in generated names.
    pub fn nic_id(&self) -> String {
        self.mac.replace(':', "")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vif {
    pub network: Network,
    pub mapping: Mapping,
}

/// Ordered; interface order in the rendered descriptor follows it.
pub type NetworkInfo = Vec<Vif>;

/// Opaque descriptor produced by a volume backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub mount_device: String,
    pub connection_info: ConnectionInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub device_name: String,
    pub swap_size: u64,
}

impl Swap {
    pub fn is_usable(&self) -> bool {
        !self.device_name.is_empty() && self.swap_size > 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ephemeral {
    pub num: u32,
    pub device_name: String,
    pub size: u64,
}

impl Ephemeral {
    /// File name of the backing disk inside the instance directory.
    pub fn disk_name(&self) -> String {
        format!("disk.eph{}", self.num)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub swap: Option<Swap>,
    #[serde(default)]
    pub ephemerals: Vec<Ephemeral>,
    #[serde(default)]
    pub block_device_mapping: Vec<VolumeMapping>,
}

impl BlockDeviceInfo {
    pub fn usable_swap(&self) -> Option<&Swap> {
        self.swap.as_ref().filter(|s| s.is_usable())
    }
}

/// Drops a leading `/dev/` from a device name.
pub fn strip_dev(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

/// Whether `device` is claimed by a volume, usable swap, or an ephemeral
/// disk in `info`. The root device name is deliberately not consulted.
pub fn volume_in_mapping(device: &str, info: Option<&BlockDeviceInfo>) -> bool {
    let Some(info) = info else {
        return false;
    };
    let device = strip_dev(device);
    info.block_device_mapping
        .iter()
        .map(|vol| strip_dev(&vol.mount_device))
        .chain(info.usable_swap().map(|s| strip_dev(&s.device_name)))
        .chain(info.ephemerals.iter().map(|e| strip_dev(&e.device_name)))
        .any(|d| d == device)
}

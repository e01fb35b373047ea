// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the compute agent.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub hypervisor: Hypervisor,

    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub firewall: Firewall,

    #[serde(default)]
    pub migration: Migration,

    #[serde(default)]
    pub volume: Volume,

    #[serde(default)]
    pub exec: Exec,
}

/// Hypervisor variants the agent knows how to drive.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VirtType {
    Qemu,
    #[default]
    Kvm,
    Uml,
    Xen,
    Lxc,
}

impl VirtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtType::Qemu => "qemu",
            VirtType::Kvm => "kvm",
            VirtType::Uml => "uml",
            VirtType::Xen => "xen",
            VirtType::Lxc => "lxc",
        }
    }
}

impl fmt::Display for VirtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Hypervisor {
    #[serde(rename = "type")]
    pub virt_type: VirtType,

    /// Explicit connection URI. When set it always wins over the
    /// variant-derived default.
    pub uri: Option<String>,

    pub instances_path: PathBuf,
    pub use_cow_images: bool,
    pub disk_prefix: Option<String>,
    pub use_virtio_for_bridges: bool,
    pub vnc_enabled: bool,
    pub vncserver_host: String,
    pub vnc_keymap: String,
    pub rescue_image_id: Option<String>,
    pub rescue_kernel_id: Option<String>,
    pub rescue_ramdisk_id: Option<String>,

    /// Size in bytes that fetched root images are grown to, if any.
    pub minimum_root_size: Option<u64>,
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self {
            virt_type: VirtType::default(),
            uri: None,
            instances_path: PathBuf::from("/var/lib/stratus/instances"),
            use_cow_images: true,
            disk_prefix: None,
            use_virtio_for_bridges: true,
            vnc_enabled: true,
            vncserver_host: "127.0.0.1".to_string(),
            vnc_keymap: "en-us".to_string(),
            rescue_image_id: None,
            rescue_kernel_id: None,
            rescue_ramdisk_id: None,
            minimum_root_size: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Network {
    pub my_ip: String,
    pub use_ipv6: bool,
    pub allow_same_net_traffic: bool,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            my_ip: "127.0.0.1".to_string(),
            use_ipv6: false,
            allow_same_net_traffic: true,
        }
    }
}

/// Which isolation engine guards instance traffic.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallKind {
    #[default]
    Iptables,
    Nwfilter,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Firewall {
    pub driver: FirewallKind,

    /// Prefix given to every generated chain and filter object.
    pub binary_name: String,
}

impl Default for Firewall {
    fn default() -> Self {
        Self {
            driver: FirewallKind::default(),
            binary_name: "stratus-agent".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Migration {
    /// Destination URI template; `%s` is replaced by the destination host.
    pub uri: String,
    pub bandwidth: u64,
    pub flags: Vec<String>,
    pub block_flags: Vec<String>,
    pub retry_count: u32,
    pub retry_interval_secs: u64,
}

impl Default for Migration {
    fn default() -> Self {
        let flags = vec![
            "VIR_MIGRATE_UNDEFINE_SOURCE".to_string(),
            "VIR_MIGRATE_PEER2PEER".to_string(),
        ];
        let mut block_flags = flags.clone();
        block_flags.push("VIR_MIGRATE_NON_SHARED_INC".to_string());
        Self {
            uri: "qemu+tcp://%s/system".to_string(),
            bandwidth: 0,
            flags,
            block_flags,
            retry_count: 30,
            retry_interval_secs: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Volume {
    pub iscsi_scan_tries: u32,
    pub iscsi_by_path_dir: PathBuf,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            iscsi_scan_tries: 3,
            iscsi_by_path_dir: PathBuf::from("/dev/disk/by-path"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Exec {
    /// Command prepended to anything that must run with privileges.
    pub root_helper: String,
}

impl Default for Exec {
    fn default() -> Self {
        Self { root_helper: "sudo".to_string() }
    }
}

/// Errors which may be returned when parsing the agent configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parses configuration from TOML text.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config::default();
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.migration.retry_count, 30);
        assert_eq!(cfg.migration.uri, "qemu+tcp://%s/system");
        assert_eq!(cfg.firewall.driver, FirewallKind::Iptables);
    }

    #[test]
    fn parse_partial_config() {
        let raw = r#"
            [hypervisor]
            type = "lxc"
            uri = "lxc:///custom"
            instances_path = "/srv/instances"

            [network]
            use_ipv6 = true

            [firewall]
            driver = "nwfilter"

            [migration]
            bandwidth = 50
        "#;
        let cfg = parse_str(raw).unwrap();
        assert_eq!(cfg.hypervisor.virt_type, VirtType::Lxc);
        assert_eq!(cfg.hypervisor.uri.as_deref(), Some("lxc:///custom"));
        assert_eq!(cfg.hypervisor.instances_path, PathBuf::from("/srv/instances"));
        assert!(cfg.hypervisor.use_cow_images);
        assert!(cfg.network.use_ipv6);
        assert!(cfg.network.allow_same_net_traffic);
        assert_eq!(cfg.firewall.driver, FirewallKind::Nwfilter);
        assert_eq!(cfg.migration.bandwidth, 50);
        assert_eq!(cfg.migration.retry_count, 30);
    }

    #[test]
    fn unknown_virt_type_is_rejected() {
        let err = parse_str("[hypervisor]\ntype = \"vbox\"\n").unwrap_err();
        assert!(matches!(err, ParseError::Toml(_)));
    }

    #[test]
    fn parse_from_file() {
        let dir = std::env::temp_dir().join(format!(
            "stratus-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.toml");
        std::fs::write(&path, "[exec]\nroot_helper = \"doas\"\n").unwrap();
        let cfg = parse(&path).unwrap();
        assert_eq!(cfg.exec.root_helper, "doas");
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(parse(dir.join("missing.toml")), Err(ParseError::Io(_))));
    }
}

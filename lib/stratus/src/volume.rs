// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume drivers: turning a backend's connection descriptor into a host
//! attachment and a disk stanza for the domain descriptor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn, Logger};
use thiserror::Error;

use crate::descriptor::Element;
use crate::exec::{Cmd, ExecError, ProcessRunner};
use crate::instance::ConnectionInfo;

const CHAP_PASSWORD_KEY: &str = "node.session.auth.password";

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume driver not found for type {0:?}")]
    DriverNotFound(String),

    #[error("{driver} connection info is missing {key:?}")]
    MissingProperty { driver: &'static str, key: &'static str },

    #[error("iSCSI device not found at {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("volume I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The transports a volume can be attached over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeDriver {
    /// A block device already present on the host at `device_path`.
    Local,
    /// An iSCSI target logged in through `iscsiadm`.
    Iscsi,
    /// A network block protocol the hypervisor speaks natively (rbd,
    /// sheepdog).
    Network,
    Fake,
}

pub struct VolumeDriverRegistry {
    drivers: BTreeMap<String, VolumeDriver>,
    scan_tries: u32,
    by_path_dir: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    // iscsiadm node records must not be edited concurrently.
    iscsi_lock: tokio::sync::Mutex<()>,
    log: Logger,
}

impl VolumeDriverRegistry {
    /// Builds a registry with the stock `iscsi`, `local`, `rbd`, `sheepdog`
    /// and `fake` drivers.
    pub fn new(
        config: &stratus_config::Volume,
        runner: Arc<dyn ProcessRunner>,
        log: &Logger,
    ) -> Self {
        let drivers = [
            ("iscsi", VolumeDriver::Iscsi),
            ("local", VolumeDriver::Local),
            ("fake", VolumeDriver::Fake),
            ("rbd", VolumeDriver::Network),
            ("sheepdog", VolumeDriver::Network),
        ]
        .into_iter()
        .map(|(name, driver)| (name.to_string(), driver))
        .collect();

        Self {
            drivers,
            scan_tries: config.iscsi_scan_tries,
            by_path_dir: config.iscsi_by_path_dir.clone(),
            runner,
            iscsi_lock: tokio::sync::Mutex::new(()),
            log: log.new(slog::o!("component" => "volume")),
        }
    }

    pub fn register(&mut self, volume_type: &str, driver: VolumeDriver) {
        self.drivers.insert(volume_type.to_string(), driver);
    }

    pub fn driver(&self, volume_type: &str) -> Result<VolumeDriver, VolumeError> {
        self.drivers
            .get(volume_type)
            .copied()
            .ok_or_else(|| VolumeError::DriverNotFound(volume_type.to_string()))
    }

    fn iscsi_device(&self, info: &ConnectionInfo) -> Result<PathBuf, VolumeError> {
        let portal = property(info, "iSCSI", "target_portal")?;
        let iqn = property(info, "iSCSI", "target_iqn")?;
        Ok(self.by_path_dir.join(format!("ip-{portal}-iscsi-{iqn}-lun-0")))
    }

    /// Renders the disk stanza for an attached volume. Performs no I/O.
    pub fn disk_stanza(
        &self,
        info: &ConnectionInfo,
        mount_device: &str,
    ) -> Result<Element, VolumeError> {
        let (disk_type, source) = match self.driver(&info.driver_volume_type)? {
            VolumeDriver::Local => {
                let path = property(info, "local", "device_path")?;
                ("block", Element::new("source").attr("dev", path))
            }
            VolumeDriver::Iscsi => {
                let path = self.iscsi_device(info)?;
                ("block", Element::new("source").attr("dev", path.display()))
            }
            VolumeDriver::Network => {
                let name = property(info, "network", "name")?;
                (
                    "network",
                    Element::new("source")
                        .attr("protocol", &info.driver_volume_type)
                        .attr("name", name),
                )
            }
            VolumeDriver::Fake => (
                "network",
                Element::new("source")
                    .attr("protocol", "fake")
                    .attr("name", "fake"),
            ),
        };
        Ok(Element::new("disk")
            .attr("type", disk_type)
            .child(Element::new("driver").attr("name", "qemu").attr("type", "raw"))
            .child(source)
            .child(
                Element::new("target")
                    .attr("dev", mount_device)
                    .attr("bus", "virtio"),
            ))
    }

    /// Establishes the host side of the attachment and returns the stanza
    /// to hand to the hypervisor.
    pub async fn connect_volume(
        &self,
        info: &ConnectionInfo,
        mount_device: &str,
    ) -> Result<Element, VolumeError> {
        if self.driver(&info.driver_volume_type)? == VolumeDriver::Iscsi {
            self.iscsi_connect(info).await?;
        }
        self.disk_stanza(info, mount_device)
    }

    pub async fn disconnect_volume(
        &self,
        info: &ConnectionInfo,
        _mount_device: &str,
    ) -> Result<(), VolumeError> {
        if self.driver(&info.driver_volume_type)? == VolumeDriver::Iscsi {
            let _guard = self.iscsi_lock.lock().await;
            self.iscsiadm_update(info, "node.startup", "manual").await?;
            self.iscsiadm(info, &["--logout"]).await?;
            self.iscsiadm(info, &["--op", "delete"]).await?;
        }
        Ok(())
    }

    fn iscsiadm_node(info: &ConnectionInfo) -> Result<Cmd, VolumeError> {
        let iqn = property(info, "iSCSI", "target_iqn")?;
        let portal = property(info, "iSCSI", "target_portal")?;
        Ok(Cmd::new("iscsiadm")
            .args(["-m", "node", "-T", iqn, "-p", portal])
            .as_root())
    }

    async fn run_iscsiadm(&self, cmd: Cmd) -> Result<(), VolumeError> {
        let line = cmd.to_string();
        let out = self.runner.run(cmd).await?;
        debug!(self.log, "iscsiadm";
            "cmd" => line, "stdout" => out.stdout, "stderr" => out.stderr);
        Ok(())
    }

    async fn iscsiadm(
        &self,
        info: &ConnectionInfo,
        extra: &[&str],
    ) -> Result<(), VolumeError> {
        let cmd = Self::iscsiadm_node(info)?.args(extra.iter().copied());
        self.run_iscsiadm(cmd).await
    }

    async fn iscsiadm_update(
        &self,
        info: &ConnectionInfo,
        key: &str,
        value: &str,
    ) -> Result<(), VolumeError> {
        let cmd = Self::iscsiadm_node(info)?.args(["--op", "update", "-n", key, "-v"]);
        let cmd = if key == CHAP_PASSWORD_KEY {
            cmd.secret_arg(value)
        } else {
            cmd.arg(value)
        };
        self.run_iscsiadm(cmd).await
    }

    async fn iscsi_connect(&self, info: &ConnectionInfo) -> Result<(), VolumeError> {
        let _guard = self.iscsi_lock.lock().await;

        // When the volume service runs on this host, discovery has already
        // created the node record.
        if self.iscsiadm(info, &[]).await.is_err() {
            self.iscsiadm(info, &["--op", "new"]).await?;
        }

        if let Some(method) = info.data.get("auth_method") {
            self.iscsiadm_update(info, "node.session.auth.authmethod", method)
                .await?;
            let user = property(info, "iSCSI", "auth_username")?;
            self.iscsiadm_update(info, "node.session.auth.username", user)
                .await?;
            let pass = property(info, "iSCSI", "auth_password")?;
            self.iscsiadm_update(info, CHAP_PASSWORD_KEY, pass)
                .await?;
        }

        self.iscsiadm(info, &["--login"]).await?;
        self.iscsiadm_update(info, "node.startup", "automatic").await?;

        let device = self.iscsi_device(info)?;
        let mut tries = 0;
        while !tokio::fs::try_exists(&device).await? {
            if tries >= self.scan_tries {
                return Err(VolumeError::DeviceNotFound(device));
            }
            warn!(self.log, "iSCSI volume not yet found, rescanning";
                "device" => %device.display(), "tries" => tries);
            self.iscsiadm(info, &["--rescan"]).await?;
            tries += 1;
            if !tokio::fs::try_exists(&device).await? {
                tokio::time::sleep(Duration::from_secs(u64::from(tries * tries)))
                    .await;
            }
        }
        if tries != 0 {
            debug!(self.log, "found iSCSI device";
                "device" => %device.display(), "tries" => tries);
        }
        Ok(())
    }
}

fn property<'a>(
    info: &'a ConnectionInfo,
    driver: &'static str,
    key: &'static str,
) -> Result<&'a str, VolumeError> {
    info.data
        .get(key)
        .map(String::as_str)
        .ok_or(VolumeError::MissingProperty { driver, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::exec::{CommandOutput, MockProcessRunner};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn registry(runner: MockProcessRunner, by_path: PathBuf) -> VolumeDriverRegistry {
        let config = stratus_config::Volume {
            iscsi_scan_tries: 2,
            iscsi_by_path_dir: by_path,
        };
        VolumeDriverRegistry::new(&config, Arc::new(runner), &test_logger())
    }

    fn iscsi_info() -> ConnectionInfo {
        ConnectionInfo {
            driver_volume_type: "iscsi".to_string(),
            data: [
                ("target_portal", "10.0.2.15:3260"),
                ("target_iqn", "iqn.2010-10.org.openstack:volume-00000001"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }

    fn net_info(kind: &str, name: &str) -> ConnectionInfo {
        ConnectionInfo {
            driver_volume_type: kind.to_string(),
            data: [("name".to_string(), name.to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn iscsi_stanza_points_at_by_path_device() {
        let reg = registry(MockProcessRunner::new(), "/dev/disk/by-path".into());
        let disk = reg.disk_stanza(&iscsi_info(), "vde").unwrap();
        assert_eq!(disk.get_attr("type"), Some("block"));
        assert_eq!(
            disk.find("source").unwrap().get_attr("dev"),
            Some(
                "/dev/disk/by-path/ip-10.0.2.15:3260-iscsi-\
                 iqn.2010-10.org.openstack:volume-00000001-lun-0"
            )
        );
        assert_eq!(disk.find("target").unwrap().get_attr("dev"), Some("vde"));
    }

    #[test]
    fn network_stanzas_carry_protocol_and_name() {
        let reg = registry(MockProcessRunner::new(), "/dev/disk/by-path".into());

        let disk = reg
            .disk_stanza(&net_info("sheepdog", "volume-00000001"), "vde")
            .unwrap();
        assert_eq!(disk.get_attr("type"), Some("network"));
        let source = disk.find("source").unwrap();
        assert_eq!(source.get_attr("protocol"), Some("sheepdog"));
        assert_eq!(source.get_attr("name"), Some("volume-00000001"));

        let disk = reg
            .disk_stanza(&net_info("rbd", "rbd/volume-00000001"), "vdf")
            .unwrap();
        let source = disk.find("source").unwrap();
        assert_eq!(source.get_attr("protocol"), Some("rbd"));
        assert_eq!(source.get_attr("name"), Some("rbd/volume-00000001"));
    }

    #[test]
    fn unknown_driver_type_is_not_found() {
        let reg = registry(MockProcessRunner::new(), "/dev/disk/by-path".into());
        let err = reg
            .disk_stanza(&net_info("badtype", "x"), "vde")
            .unwrap_err();
        assert!(matches!(err, VolumeError::DriverNotFound(t) if t == "badtype"));
    }

    #[tokio::test]
    async fn iscsi_connect_logs_in_and_finds_device() {
        let dir = tempfile::tempdir().unwrap();
        let info = iscsi_info();
        std::fs::write(
            dir.path().join(
                "ip-10.0.2.15:3260-iscsi-iqn.2010-10.org.openstack:volume-00000001-lun-0",
            ),
            b"",
        )
        .unwrap();

        let mut runner = MockProcessRunner::new();
        let mut seq = mockall::Sequence::new();
        let expected: [&[&str]; 3] = [
            &[],
            &["--login"],
            &["--op", "update", "-n", "node.startup", "-v", "automatic"],
        ];
        for extra in expected {
            runner
                .expect_run()
                .withf(move |cmd| {
                    cmd.program == "iscsiadm" && cmd.run_as_root && cmd.args[6..] == *extra
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(CommandOutput::default()));
        }

        let reg = registry(runner, dir.path().to_path_buf());
        let disk = reg.connect_volume(&info, "vdb").await.unwrap();
        assert_eq!(disk.get_attr("type"), Some("block"));
    }

    #[tokio::test]
    async fn chap_password_is_masked_in_command_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(
                "ip-10.0.2.15:3260-iscsi-iqn.2010-10.org.openstack:volume-00000001-lun-0",
            ),
            b"",
        )
        .unwrap();
        let mut info = iscsi_info();
        for (k, v) in [
            ("auth_method", "CHAP"),
            ("auth_username", "admin"),
            ("auth_password", "s3cr3t"),
        ] {
            info.data.insert(k.to_string(), v.to_string());
        }

        let commands = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = commands.clone();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(move |cmd| {
            seen.lock().unwrap().push(cmd);
            Ok(CommandOutput::default())
        });

        let reg = registry(runner, dir.path().to_path_buf());
        reg.connect_volume(&info, "vdb").await.unwrap();

        let commands = commands.lock().unwrap();
        let password = commands
            .iter()
            .find(|c| c.args.iter().any(|a| a == CHAP_PASSWORD_KEY))
            .unwrap();
        assert_eq!(password.args.last().map(String::as_str), Some("s3cr3t"));
        assert!(password.to_string().ends_with("-v ******"));
        for cmd in commands.iter() {
            assert!(!cmd.to_string().contains("s3cr3t"), "{cmd}");
        }
        let username = commands
            .iter()
            .find(|c| c.args.iter().any(|a| a == "node.session.auth.username"))
            .unwrap();
        assert!(username.to_string().ends_with("-v admin"));
    }

    #[tokio::test(start_paused = true)]
    async fn iscsi_connect_gives_up_when_device_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockProcessRunner::new();
        let rescans = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = rescans.clone();
        runner.expect_run().returning(move |cmd| {
            if cmd.args.last().map(String::as_str) == Some("--rescan") {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(CommandOutput::default())
        });

        let reg = registry(runner, dir.path().to_path_buf());
        let err = reg.connect_volume(&iscsi_info(), "vdb").await.unwrap_err();
        assert!(matches!(err, VolumeError::DeviceNotFound(_)));
        assert_eq!(rescans.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

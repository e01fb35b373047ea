// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driver façade the control plane talks to.
//!
//! [`HypervisorConnection`] owns one handle to the hypervisor management
//! layer and composes the image cache, descriptor builder, volume drivers,
//! firewall engine, migration orchestrator and host-state reporter into
//! instance lifecycle operations.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use stratus_config::{Config, VirtType};
use thiserror::Error;

use crate::descriptor::{DescriptorError, DomainDescriptorBuilder};
use crate::exec::{Cmd, ExecError, ProcessRunner};
use crate::firewall::{self, FirewallDriver, FirewallError, SecurityGroupStore};
use crate::host_state::{
    filesystem_usage, parse_meminfo, CapacitySource, CapacityStore, HostStateError,
    HostStateReporter, HostStats,
};
use crate::hypervisor::{CpuInfo, Hypervisor, HypervisorError};
use crate::image_cache::ImageCache;
use crate::images::{self, image_key, ImageError, ImageService};
use crate::instance::{
    strip_dev, volume_in_mapping, BlockDeviceInfo, ConnectionInfo, Instance, NetworkInfo,
    PowerState,
};
use crate::migrate::{MigrateError, MigrationOrchestrator, MigrationRecovery, MigrationRequest};
use crate::volume::{VolumeDriverRegistry, VolumeError};

const STATE_POLL: Duration = Duration::from_millis(500);
const GIB: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("disk {0} not found")]
    DiskNotFound(String),

    #[error("destination {} already exists", .0.display())]
    DestinationExists(PathBuf),

    #[error("instance {instance} is in the wrong state: {reason}")]
    InvalidState { instance: String, reason: String },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error(transparent)]
    HostState(#[from] HostStateError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("instance storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed disk report: {0}")]
    Json(#[from] serde_json::Error),
}

/// One file-backed disk of an instance, as exchanged during block
/// migration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub path: String,
    /// Rounded-up size such as `10G`.
    pub local_gb: String,
    /// Basename of the backing file, or empty.
    pub backing_file: String,
}

/// The image ids a set of instance disks is built from.
struct DiskImages<'a> {
    image_id: &'a str,
    kernel_id: Option<&'a str>,
    ramdisk_id: Option<&'a str>,
}

/// A cached base that is generated locally rather than downloaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlankBase {
    Ephemeral { size_gb: u64 },
    Swap { size_mb: u64 },
}

impl BlankBase {
    /// Recognizes the `ephemeral_<num>_<gb>_<os>` and `swap_<mb>` cache keys.
    fn from_key(key: &str) -> Option<Self> {
        if let Some(mb) = key.strip_prefix("swap_") {
            return mb.parse().ok().map(|size_mb| BlankBase::Swap { size_mb });
        }
        let size = key.strip_prefix("ephemeral_")?.split('_').nth(1)?;
        size.parse().ok().map(|size_gb| BlankBase::Ephemeral { size_gb })
    }
}

/// Connection URI for the configured hypervisor variant. An explicit
/// `uri` always wins.
pub fn connection_uri(config: &stratus_config::Hypervisor) -> String {
    if let Some(uri) = &config.uri {
        return uri.clone();
    }
    match config.virt_type {
        VirtType::Uml => "uml:///system",
        VirtType::Xen => "xen:///",
        VirtType::Lxc => "lxc:///",
        VirtType::Qemu | VirtType::Kvm => "qemu:///system",
    }
    .to_string()
}

pub struct HypervisorConnection {
    config: Config,
    hypervisor: Arc<dyn Hypervisor>,
    runner: Arc<dyn ProcessRunner>,
    images: Arc<dyn ImageService>,
    cache: ImageCache,
    volumes: Arc<VolumeDriverRegistry>,
    firewall: Box<dyn FirewallDriver>,
    migration: MigrationOrchestrator,
    host_state: HostStateReporter,
    log: Logger,
}

impl HypervisorConnection {
    pub fn new(
        config: Config,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn ProcessRunner>,
        images: Arc<dyn ImageService>,
        store: Arc<dyn SecurityGroupStore>,
        log: &Logger,
    ) -> Result<Self, DriverError> {
        let log = log.new(slog::o!(
            "component" => "connection",
            "uri" => connection_uri(&config.hypervisor),
        ));
        let volumes =
            Arc::new(VolumeDriverRegistry::new(&config.volume, runner.clone(), &log));
        let firewall = firewall::new_driver(
            &config,
            hypervisor.clone(),
            runner.clone(),
            store,
            &log,
        );
        let migration = MigrationOrchestrator::new(
            &config,
            hypervisor.clone(),
            volumes.clone(),
            &log,
        )?;
        Ok(Self {
            cache: ImageCache::new(&log),
            host_state: HostStateReporter::new(&log),
            config,
            hypervisor,
            runner,
            images,
            volumes,
            firewall,
            migration,
            log,
        })
    }

    pub fn get_uri(&self) -> String {
        connection_uri(&self.config.hypervisor)
    }

    pub fn get_host_ip_addr(&self) -> &str {
        &self.config.network.my_ip
    }

    fn descriptor(&self) -> DomainDescriptorBuilder<'_> {
        DomainDescriptorBuilder::new(&self.config, &self.volumes)
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.config.hypervisor.instances_path.join(name)
    }

    fn base_dir(&self) -> PathBuf {
        self.config.hypervisor.instances_path.join("_base")
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.hypervisor.list_domains().await?)
    }

    pub async fn get_info(&self, name: &str) -> Result<PowerState, DriverError> {
        self.hypervisor
            .domain_state(name)
            .await?
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()).into())
    }

    pub fn to_xml(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        rescue: bool,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<String, DriverError> {
        Ok(self
            .descriptor()
            .build(instance, network_info, rescue, block_device_info)?
            .render())
    }

    pub fn volume_in_mapping(
        &self,
        device: &str,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> bool {
        volume_in_mapping(device, block_device_info)
    }

    /// Materializes `target` from the cached base image `key`, building the
    /// base with `build` the first time it is needed.
    pub async fn cache_image<F, Fut>(
        &self,
        key: &str,
        target: &Path,
        cow: bool,
        build: F,
    ) -> Result<(), DriverError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), ImageError>>,
    {
        if tokio::fs::try_exists(target).await? {
            return Ok(());
        }
        let base_dir = self.base_dir();
        tokio::fs::create_dir_all(&base_dir).await?;
        let base = base_dir.join(key);
        self.cache.fetch(key, &base, build).await?;

        if cow {
            images::create_cow_image(&*self.runner, &base, target).await?;
        } else {
            self.runner
                .run(Cmd::new("cp").args([
                    base.display().to_string(),
                    target.display().to_string(),
                ]))
                .await?;
        }
        Ok(())
    }

    async fn cache_fetched(
        &self,
        image_id: &str,
        key: &str,
        target: &Path,
        cow: bool,
    ) -> Result<(), DriverError> {
        let (runner, service) = (&*self.runner, &*self.images);
        self.cache_image(key, target, cow, |base| async move {
            images::fetch_to_raw(runner, service, image_id, &base).await
        })
        .await
    }

    async fn create_ephemeral(
        &self,
        instance: &Instance,
        num: u32,
        size_gb: u64,
        target: &Path,
    ) -> Result<(), DriverError> {
        let os_type = instance.os_type.as_deref().unwrap_or("default");
        let key = format!("ephemeral_{num}_{size_gb}_{os_type}");
        let runner = &*self.runner;
        self.cache_image(&key, target, self.config.hypervisor.use_cow_images, |base| {
            async move {
                images::create_local(runner, &base, size_gb, 'G', Some("ext3")).await
            }
        })
        .await
    }

    async fn create_image(
        &self,
        instance: &Instance,
        descriptor: &str,
        rescue: bool,
        disk_images: DiskImages<'_>,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<(), DriverError> {
        let dir = self.instance_dir(&instance.name);
        let suffix = if rescue { ".rescue" } else { "" };
        let cow = self.config.hypervisor.use_cow_images;
        tokio::fs::create_dir_all(&dir).await?;

        tokio::fs::write(dir.join("libvirt.xml"), descriptor).await?;
        if !tokio::fs::try_exists(dir.join("console.log")).await? {
            tokio::fs::write(dir.join("console.log"), b"").await?;
        }
        if self.config.hypervisor.virt_type == VirtType::Lxc {
            tokio::fs::create_dir_all(dir.join("rootfs")).await?;
        }

        if let Some(kernel) = disk_images.kernel_id {
            let target = dir.join(format!("kernel{suffix}"));
            self.cache_fetched(kernel, &image_key(kernel), &target, false).await?;
        }
        if let Some(ramdisk) = disk_images.ramdisk_id {
            let target = dir.join(format!("ramdisk{suffix}"));
            self.cache_fetched(ramdisk, &image_key(ramdisk), &target, false).await?;
        }

        let builder = self.descriptor();
        if rescue || !volume_in_mapping(&builder.default_root_device(), block_device_info)
        {
            let mut key = image_key(disk_images.image_id);
            let size = if rescue {
                key.push_str("_sm");
                None
            } else {
                self.config.hypervisor.minimum_root_size
            };
            let target = dir.join(format!("disk{suffix}"));
            self.cache_fetched(disk_images.image_id, &key, &target, cow).await?;
            if let Some(size) = size {
                images::extend(&*self.runner, &target, size).await?;
            }
        }
        if rescue {
            return Ok(());
        }

        let eph0 = block_device_info.is_some_and(|b| b.ephemerals.iter().any(|e| e.num == 0));
        if instance.local_gb > 0
            && !eph0
            && !volume_in_mapping(&builder.default_local_device(), block_device_info)
        {
            self.create_ephemeral(instance, 0, instance.local_gb, &dir.join("disk.local"))
                .await?;
        }
        for eph in block_device_info.into_iter().flat_map(|b| &b.ephemerals) {
            self.create_ephemeral(instance, eph.num, eph.size, &dir.join(eph.disk_name()))
                .await?;
        }

        let swap_mb = match block_device_info.and_then(|b| b.usable_swap()) {
            Some(swap) => swap.swap_size,
            None if !volume_in_mapping(
                &builder.default_swap_device(),
                block_device_info,
            ) =>
            {
                instance.swap_mb
            }
            None => 0,
        };
        if swap_mb > 0 {
            let runner = &*self.runner;
            self.cache_image(&format!("swap_{swap_mb}"), &dir.join("disk.swap"), cow, |base| {
                async move { images::create_swap(runner, &base, swap_mb).await }
            })
            .await?;
        }
        Ok(())
    }

    async fn wait_for_running(&self, name: &str) -> Result<(), DriverError> {
        loop {
            match self.hypervisor.domain_state(name).await? {
                Some(PowerState::Running) => {
                    info!(self.log, "instance running"; "instance" => name);
                    return Ok(());
                }
                Some(_) => tokio::time::sleep(STATE_POLL).await,
                None => {
                    return Err(HypervisorError::DomainNotFound(name.to_string()).into())
                }
            }
        }
    }

    async fn wait_for_gone(&self, name: &str) -> Result<(), DriverError> {
        while self.hypervisor.domain_state(name).await?.is_some() {
            tokio::time::sleep(STATE_POLL).await;
        }
        Ok(())
    }

    async fn launch(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        descriptor: &str,
    ) -> Result<(), DriverError> {
        self.hypervisor.define_domain(descriptor).await?;
        self.hypervisor.start_domain(&instance.name).await?;
        self.firewall
            .apply_instance_filter(instance, network_info)
            .await?;
        self.wait_for_running(&instance.name).await
    }

    pub async fn spawn(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<(), DriverError> {
        let descriptor = self.to_xml(instance, network_info, false, block_device_info)?;
        self.firewall
            .setup_basic_filtering(instance, network_info)
            .await?;
        self.firewall
            .prepare_instance_filter(instance, network_info)
            .await?;
        let disk_images = DiskImages {
            image_id: &instance.image_ref,
            kernel_id: instance.kernel_id.as_deref(),
            ramdisk_id: instance.ramdisk_id.as_deref(),
        };
        self.create_image(instance, &descriptor, false, disk_images, block_device_info)
            .await?;
        info!(self.log, "defining domain"; "instance" => &instance.name);
        self.launch(instance, network_info, &descriptor).await
    }

    pub async fn destroy(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        block_device_info: Option<&BlockDeviceInfo>,
        cleanup: bool,
    ) -> Result<(), DriverError> {
        let name = &instance.name;
        if self.hypervisor.domain_state(name).await?.is_some() {
            if let Err(e) = self.hypervisor.destroy_domain(name).await {
                let state = self.hypervisor.domain_state(name).await?;
                if state != Some(PowerState::Shutoff) {
                    warn!(self.log, "failed to destroy domain";
                        "instance" => name, "error" => %e);
                    return Err(e.into());
                }
                debug!(self.log, "domain already shut off"; "instance" => name);
            }
            if self.hypervisor.has_managed_save(name).await? {
                self.hypervisor.remove_managed_save(name).await?;
            }
            self.hypervisor.undefine_domain(name).await?;
        }
        self.wait_for_gone(name).await?;

        self.firewall.unfilter_instance(instance, network_info).await?;

        for vol in block_device_info.into_iter().flat_map(|b| &b.block_device_mapping) {
            self.volumes
                .disconnect_volume(&vol.connection_info, strip_dev(&vol.mount_device))
                .await?;
        }

        if cleanup {
            let dir = self.instance_dir(name);
            if tokio::fs::try_exists(&dir).await? {
                info!(self.log, "removing instance files";
                    "instance" => name, "path" => %dir.display());
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(())
    }

    /// Tears the domain down and re-creates it from `descriptor`.
    async fn reboot_with(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        descriptor: &str,
    ) -> Result<(), DriverError> {
        self.destroy(instance, network_info, None, false).await?;
        self.firewall
            .setup_basic_filtering(instance, network_info)
            .await?;
        self.firewall
            .prepare_instance_filter(instance, network_info)
            .await?;
        self.launch(instance, network_info, descriptor).await
    }

    pub async fn reboot(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), DriverError> {
        let descriptor = self.hypervisor.domain_descriptor(&instance.name).await?;
        self.reboot_with(instance, network_info, &descriptor).await
    }

    pub async fn rescue(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), DriverError> {
        let current = self.hypervisor.domain_descriptor(&instance.name).await?;
        let dir = self.instance_dir(&instance.name);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("unrescue.xml"), &current).await?;

        let hv = &self.config.hypervisor;
        let disk_images = DiskImages {
            image_id: hv.rescue_image_id.as_deref().unwrap_or(&instance.image_ref),
            kernel_id: hv.rescue_kernel_id.as_deref().or(instance.kernel_id.as_deref()),
            ramdisk_id: hv
                .rescue_ramdisk_id
                .as_deref()
                .or(instance.ramdisk_id.as_deref()),
        };
        let descriptor = self.to_xml(instance, network_info, true, None)?;
        self.create_image(instance, &descriptor, true, disk_images, None)
            .await?;
        info!(self.log, "rebooting into rescue"; "instance" => &instance.name);
        self.reboot_with(instance, network_info, &descriptor).await
    }

    pub async fn unrescue(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), DriverError> {
        let dir = self.instance_dir(&instance.name);
        let saved = dir.join("unrescue.xml");
        let descriptor = match tokio::fs::read_to_string(&saved).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DriverError::InvalidState {
                    instance: instance.name.clone(),
                    reason: "instance is not in rescue mode".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_file(&saved).await?;
        self.reboot_with(instance, network_info, &descriptor).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(".rescue") {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    pub async fn attach_volume(
        &self,
        connection_info: &ConnectionInfo,
        instance_name: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError> {
        let device = strip_dev(mountpoint);
        let stanza = self.volumes.connect_volume(connection_info, device).await?;
        if let Err(e) = self
            .hypervisor
            .attach_device(instance_name, &stanza.render())
            .await
        {
            warn!(self.log, "attach failed, disconnecting volume";
                "instance" => instance_name, "device" => device, "error" => %e);
            self.volumes.disconnect_volume(connection_info, device).await?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Detaches the disk at `mountpoint`. The volume is disconnected on
    /// this host even when the domain or the disk is already gone.
    pub async fn detach_volume(
        &self,
        connection_info: &ConnectionInfo,
        instance_name: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError> {
        let device = strip_dev(mountpoint);
        let detached = self.hypervisor.detach_disk(instance_name, device).await;
        self.volumes.disconnect_volume(connection_info, device).await?;
        match detached {
            Ok(()) => Ok(()),
            Err(HypervisorError::DiskNotFound { .. }) => {
                Err(DriverError::DiskNotFound(mountpoint.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Describes the instance's file-backed disks as a JSON list of
    /// [`DiskInfo`].
    pub async fn get_instance_disk_info(&self, name: &str) -> Result<String, DriverError> {
        let mut report = Vec::new();
        for disk in self.hypervisor.domain_disks(name).await? {
            let Some(path) = disk.source.filter(|_| disk.kind == "file") else {
                continue;
            };
            let path_ref = Path::new(&path);

            let mut probed = None;
            let disk_type = match disk.driver_type {
                Some(t) => t,
                None => {
                    let info = images::qemu_img_info(&*self.runner, path_ref).await?;
                    let format = info.format.clone().unwrap_or_else(|| "raw".to_string());
                    probed = Some(info);
                    format
                }
            };

            let (size, backing_file) = if disk_type == "raw" {
                (tokio::fs::metadata(path_ref).await?.len(), String::new())
            } else {
                let info = match probed {
                    Some(info) => info,
                    None => images::qemu_img_info(&*self.runner, path_ref).await?,
                };
                let backing = info
                    .backing_file
                    .as_deref()
                    .and_then(|b| Path::new(b).file_name())
                    .map(|b| b.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (info.virtual_size.unwrap_or(0), backing)
            };

            report.push(DiskInfo {
                disk_type,
                path,
                local_gb: images::format_size(size),
                backing_file,
            });
        }
        Ok(serde_json::to_string(&report)?)
    }

    /// Prepares empty disks on this (destination) host for a block
    /// migration, backed by the same cached base images as the source.
    pub async fn pre_block_migration(
        &self,
        instance: &Instance,
        disk_info_json: &str,
    ) -> Result<(), DriverError> {
        let dir = self.instance_dir(&instance.name);
        if tokio::fs::try_exists(&dir).await? {
            return Err(DriverError::DestinationExists(dir));
        }
        let disks: Vec<DiskInfo> = serde_json::from_str(disk_info_json)?;
        tokio::fs::create_dir_all(&dir).await?;

        let (runner, service) = (&*self.runner, &*self.images);
        for disk in disks {
            let Some(file_name) = Path::new(&disk.path).file_name() else {
                continue;
            };
            let target = dir.join(file_name);
            let mut cmd = Cmd::new("qemu-img").args(["create", "-f", disk.disk_type.as_str()]);
            if !disk.backing_file.is_empty() {
                let base_dir = self.base_dir();
                tokio::fs::create_dir_all(&base_dir).await?;
                let base = base_dir.join(&disk.backing_file);
                let image_id = instance.image_ref.as_str();
                let blank = BlankBase::from_key(&disk.backing_file);
                self.cache
                    .fetch(&disk.backing_file, &base, |path| async move {
                        match blank {
                            Some(BlankBase::Ephemeral { size_gb }) => {
                                images::create_local(runner, &path, size_gb, 'G', Some("ext3"))
                                    .await
                            }
                            Some(BlankBase::Swap { size_mb }) => {
                                images::create_swap(runner, &path, size_mb).await
                            }
                            None => {
                                images::fetch_to_raw(runner, service, image_id, &path).await
                            }
                        }
                    })
                    .await?;
                cmd = cmd.args(["-o".to_string(), format!("backing_file={}", base.display())]);
            }
            cmd = cmd.args([target.display().to_string(), disk.local_gb.clone()]);
            runner.run(cmd).await?;
        }

        if let Some(kernel) = instance.kernel_id.as_deref() {
            self.cache_fetched(kernel, &image_key(kernel), &dir.join("kernel"), false)
                .await?;
        }
        if let Some(ramdisk) = instance.ramdisk_id.as_deref() {
            self.cache_fetched(ramdisk, &image_key(ramdisk), &dir.join("ramdisk"), false)
                .await?;
        }
        Ok(())
    }

    pub async fn pre_live_migration(
        &self,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<(), DriverError> {
        Ok(self.migration.pre_live_migration(block_device_info).await?)
    }

    pub async fn live_migration(
        &self,
        request: MigrationRequest,
        recovery: &dyn MigrationRecovery,
    ) -> Result<(), DriverError> {
        Ok(self.migration.live_migration(request, recovery).await?)
    }

    pub async fn ensure_filtering_rules_for_instance(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), DriverError> {
        Ok(self
            .migration
            .ensure_filtering_rules_for_instance(&*self.firewall, instance, network_info)
            .await?)
    }

    pub async fn unfilter_instance(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), DriverError> {
        Ok(self.firewall.unfilter_instance(instance, network_info).await?)
    }

    pub async fn refresh_security_group_rules(
        &self,
        security_group_id: u64,
    ) -> Result<(), DriverError> {
        Ok(self
            .firewall
            .refresh_security_group_rules(security_group_id)
            .await?)
    }

    pub async fn refresh_security_group_members(
        &self,
        security_group_id: u64,
    ) -> Result<(), DriverError> {
        Ok(self
            .firewall
            .refresh_security_group_members(security_group_id)
            .await?)
    }

    pub async fn refresh_provider_fw_rules(&self) -> Result<(), DriverError> {
        Ok(self.firewall.refresh_provider_fw_rules().await?)
    }

    pub async fn update_available_resource(
        &self,
        store: &dyn CapacityStore,
        host: &str,
    ) -> Result<(), DriverError> {
        Ok(self
            .host_state
            .update_available_resource(self, store, host)
            .await?)
    }

    pub async fn get_host_stats(&self, refresh: bool) -> Result<HostStats, DriverError> {
        Ok(self.host_state.get_host_stats(self, refresh).await?)
    }
}

#[async_trait]
impl CapacitySource for HypervisorConnection {
    async fn vcpu_total(&self) -> Result<u32, HostStateError> {
        Ok(std::thread::available_parallelism()?.get() as u32)
    }

    async fn vcpu_used(&self) -> Result<u32, HostStateError> {
        Ok(self.hypervisor.vcpus_used().await?)
    }

    async fn memory_mb_total(&self) -> Result<u64, HostStateError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        Ok(parse_meminfo(&meminfo)?.0)
    }

    async fn memory_mb_used(&self) -> Result<u64, HostStateError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        Ok(parse_meminfo(&meminfo)?.1)
    }

    async fn local_gb_total(&self) -> Result<u64, HostStateError> {
        let (total, _) = filesystem_usage(&self.config.hypervisor.instances_path)?;
        Ok(total / GIB)
    }

    async fn local_gb_used(&self) -> Result<u64, HostStateError> {
        let (_, used) = filesystem_usage(&self.config.hypervisor.instances_path)?;
        Ok(used / GIB)
    }

    async fn hypervisor_type(&self) -> Result<String, HostStateError> {
        Ok(self.hypervisor.hypervisor_type().await?)
    }

    async fn hypervisor_version(&self) -> Result<u64, HostStateError> {
        Ok(self.hypervisor.hypervisor_version().await?)
    }

    async fn cpu_info(&self) -> Result<CpuInfo, HostStateError> {
        Ok(self.hypervisor.cpu_info().await?)
    }
}

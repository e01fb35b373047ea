// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain descriptor rendering.

use std::path::Path;

use stratus_config::{Config, VirtType};
use thiserror::Error;

use super::Element;
use crate::cidr::{Cidr, CidrError};
use crate::firewall::graph::nic_filter_name;
use crate::instance::{
    strip_dev, volume_in_mapping, BlockDeviceInfo, Instance, NetworkInfo, Vif,
};
use crate::volume::{VolumeDriverRegistry, VolumeError};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("network {bridge} has a bad address block: {source}")]
    Network {
        bridge: String,
        #[source]
        source: CidrError,
    },

    #[error("interface {0} has no IPv4 address")]
    NoAddress(String),
}

/// Renders instances into domain descriptors.
///
/// Rendering is a pure function of the inputs and the configuration held
/// by the builder; volume stanzas come from the registry's pure mapping,
/// never from a live connection.
pub struct DomainDescriptorBuilder<'a> {
    config: &'a Config,
    volumes: &'a VolumeDriverRegistry,
}

impl<'a> DomainDescriptorBuilder<'a> {
    pub fn new(config: &'a Config, volumes: &'a VolumeDriverRegistry) -> Self {
        Self { config, volumes }
    }

    fn virt_type(&self) -> VirtType {
        self.config.hypervisor.virt_type
    }

    pub fn disk_prefix(&self) -> &str {
        if let Some(prefix) = &self.config.hypervisor.disk_prefix {
            return prefix;
        }
        match self.virt_type() {
            VirtType::Qemu | VirtType::Kvm => "vd",
            VirtType::Xen => "sd",
            VirtType::Uml => "ubd",
            VirtType::Lxc => "",
        }
    }

    fn disk_bus(&self) -> &'static str {
        match self.virt_type() {
            VirtType::Qemu | VirtType::Kvm => "virtio",
            VirtType::Xen => "scsi",
            VirtType::Uml => "uml",
            VirtType::Lxc => "",
        }
    }

    pub fn default_root_device(&self) -> String {
        format!("{}a", self.disk_prefix())
    }

    pub fn default_local_device(&self) -> String {
        format!("{}b", self.disk_prefix())
    }

    pub fn default_swap_device(&self) -> String {
        format!("{}c", self.disk_prefix())
    }

    fn driver_type(&self) -> &'static str {
        if self.config.hypervisor.use_cow_images {
            "qcow2"
        } else {
            "raw"
        }
    }

    pub fn build(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
        rescue: bool,
        block_device_info: Option<&BlockDeviceInfo>,
    ) -> Result<Element, DescriptorError> {
        let basepath =
            self.config.hypervisor.instances_path.join(&instance.name);

        let root_device_name = block_device_info
            .and_then(|b| b.root_device_name.clone())
            .or_else(|| instance.root_device_name.clone());

        let mut devices = Element::new("devices");
        if self.virt_type() == VirtType::Lxc {
            devices = devices.child(
                Element::new("filesystem")
                    .attr("type", "mount")
                    .child(
                        Element::new("source")
                            .attr("dir", basepath.join("rootfs").display()),
                    )
                    .child(Element::new("target").attr("dir", "/")),
            );
        } else {
            devices = devices.children(self.disks(
                instance,
                &basepath,
                rescue,
                root_device_name.as_deref(),
                block_device_info,
            )?);
        }

        for vif in network_info {
            devices = devices.child(self.interface(instance, vif)?);
        }

        devices = devices
            .child(
                Element::new("serial")
                    .attr("type", "file")
                    .child(
                        Element::new("source")
                            .attr("path", basepath.join("console.log").display()),
                    )
                    .child(Element::new("target").attr("port", 1)),
            )
            .child(
                Element::new("console")
                    .attr("type", "pty")
                    .child(Element::new("target").attr("port", 0)),
            )
            .child(
                Element::new("serial")
                    .attr("type", "pty")
                    .child(Element::new("target").attr("port", 0)),
            );

        let hv = &self.config.hypervisor;
        if hv.vnc_enabled && !matches!(self.virt_type(), VirtType::Lxc | VirtType::Uml)
        {
            devices = devices.child(
                Element::new("graphics")
                    .attr("type", "vnc")
                    .attr("port", -1)
                    .attr("autoport", "yes")
                    .attr("keymap", &hv.vnc_keymap)
                    .attr("listen", &hv.vncserver_host),
            );
        }

        Ok(Element::new("domain")
            .attr("type", self.virt_type())
            .leaf("name", &instance.name)
            .leaf("memory", instance.memory_kib())
            .child(self.os(instance, &basepath, rescue, root_device_name.as_deref()))
            .child(Element::new("features").child(Element::new("acpi")))
            .leaf("vcpu", instance.vcpus)
            .child(devices))
    }

    fn os(
        &self,
        instance: &Instance,
        basepath: &Path,
        rescue: bool,
        root_device_name: Option<&str>,
    ) -> Element {
        let os = Element::new("os");
        let os = match self.virt_type() {
            VirtType::Lxc => {
                return os.leaf("type", "exe").leaf("init", "/sbin/init");
            }
            VirtType::Uml => {
                return os
                    .leaf("type", "uml")
                    .leaf("kernel", "/usr/bin/linux")
                    .leaf("root", root_device_name.unwrap_or("/dev/ubda"));
            }
            VirtType::Xen => os
                .leaf("type", "linux")
                .leaf("root", root_device_name.unwrap_or("/dev/xvda")),
            VirtType::Qemu | VirtType::Kvm => os.leaf("type", "hvm"),
        };

        if rescue {
            return os
                .leaf("kernel", basepath.join("kernel.rescue").display())
                .leaf("initrd", basepath.join("ramdisk.rescue").display());
        }
        if instance.kernel_id.is_none() {
            return os.child(Element::new("boot").attr("dev", "hd"));
        }

        let cmdline = match self.virt_type() {
            VirtType::Xen => "ro".to_string(),
            _ => format!(
                "root={} console=ttyS0",
                root_device_name.unwrap_or("/dev/vda")
            ),
        };
        let os = os
            .leaf("kernel", basepath.join("kernel").display())
            .leaf("cmdline", cmdline);
        match instance.ramdisk_id {
            Some(_) => os.leaf("initrd", basepath.join("ramdisk").display()),
            None => os,
        }
    }

    fn file_disk(&self, source: &Path, target: &str) -> Element {
        Element::new("disk")
            .attr("type", "file")
            .attr("device", "disk")
            .child(Element::new("driver").attr("type", self.driver_type()))
            .child(Element::new("source").attr("file", source.display()))
            .child(
                Element::new("target")
                    .attr("dev", target)
                    .attr("bus", self.disk_bus()),
            )
    }

    fn disks(
        &self,
        instance: &Instance,
        basepath: &Path,
        rescue: bool,
        root_device_name: Option<&str>,
        bdi: Option<&BlockDeviceInfo>,
    ) -> Result<Vec<Element>, DescriptorError> {
        if rescue {
            let prefix = self.disk_prefix();
            return Ok(vec![
                self.file_disk(&basepath.join("disk.rescue"), &format!("{prefix}a")),
                self.file_disk(&basepath.join("disk"), &format!("{prefix}b")),
            ]);
        }

        let mut disks = Vec::new();

        // A volume mapped at the root device replaces the image-backed root.
        if !volume_in_mapping(&self.default_root_device(), bdi) {
            let root = root_device_name
                .map(|d| strip_dev(d).to_string())
                .unwrap_or_else(|| self.default_root_device());
            disks.push(self.file_disk(&basepath.join("disk"), &root));
        }

        let local = self.default_local_device();
        let eph0 = bdi.is_some_and(|b| b.ephemerals.iter().any(|e| e.num == 0));
        if instance.local_gb > 0 && !eph0 && !volume_in_mapping(&local, bdi) {
            disks.push(self.file_disk(&basepath.join("disk.local"), &local));
        }

        if let Some(bdi) = bdi {
            for eph in &bdi.ephemerals {
                disks.push(self.file_disk(
                    &basepath.join(eph.disk_name()),
                    strip_dev(&eph.device_name),
                ));
            }
        }

        let swap = self.default_swap_device();
        let swap_device = match bdi.and_then(|b| b.usable_swap()) {
            Some(s) => Some(strip_dev(&s.device_name).to_string()),
            None if instance.swap_mb > 0 && !volume_in_mapping(&swap, bdi) => {
                Some(swap)
            }
            None => None,
        };
        if let Some(dev) = swap_device {
            disks.push(self.file_disk(&basepath.join("disk.swap"), &dev));
        }

        if let Some(bdi) = bdi {
            for vol in &bdi.block_device_mapping {
                disks.push(self.volumes.disk_stanza(
                    &vol.connection_info,
                    strip_dev(&vol.mount_device),
                )?);
            }
        }
        Ok(disks)
    }

    /// Bridge interface for one NIC. The filterref is always emitted: both
    /// firewall drivers register the per-NIC filter it names.
    fn interface(
        &self,
        instance: &Instance,
        vif: &Vif,
    ) -> Result<Element, DescriptorError> {
        let mapping = &vif.mapping;
        let ip = mapping
            .ips
            .first()
            .ok_or_else(|| DescriptorError::NoAddress(mapping.mac.clone()))?;

        let param = |name: &str, value: String| {
            Element::new("parameter").attr("name", name).attr("value", value)
        };
        let bad_cidr = |source| DescriptorError::Network {
            bridge: vif.network.bridge.clone(),
            source,
        };

        let mut filterref = Element::new("filterref")
            .attr(
                "filter",
                nic_filter_name(
                    &self.config.firewall.binary_name,
                    &instance.name,
                    &mapping.nic_id(),
                ),
            )
            .child(param("IP", ip.ip.clone()))
            .child(param("DHCPSERVER", mapping.gateway.clone()));

        let net = &self.config.network;
        if net.allow_same_net_traffic {
            let cidr: Cidr = vif.network.cidr.parse().map_err(bad_cidr)?;
            let mask = cidr.netmask().map(|m| m.to_string()).unwrap_or_default();
            filterref = filterref
                .child(param("PROJNET", cidr.addr().to_string()))
                .child(param("PROJMASK", mask));
            if let (true, Some(v6)) = (net.use_ipv6, &vif.network.cidr_v6) {
                let cidr: Cidr = v6.parse().map_err(bad_cidr)?;
                filterref = filterref
                    .child(param("PROJNETV6", cidr.addr().to_string()))
                    .child(param("PROJMASKV6", cidr.prefix().to_string()));
            }
        }
        if let Some(gw6) = &mapping.gateway6 {
            filterref = filterref.child(param("RASERVER", format!("{gw6}/128")));
        }

        let mut iface = Element::new("interface")
            .attr("type", "bridge")
            .child(Element::new("source").attr("bridge", &vif.network.bridge))
            .child(Element::new("mac").attr("address", &mapping.mac));
        if self.config.hypervisor.use_virtio_for_bridges {
            iface = iface.child(Element::new("model").attr("type", "virtio"));
        }
        Ok(iface.child(filterref))
    }
}

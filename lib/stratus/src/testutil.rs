// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures and in-memory stand-ins for the daemons the driver talks to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use slog::Logger;
use uuid::Uuid;

use crate::exec::{Cmd, CommandOutput, ExecError, ProcessRunner};
use crate::firewall::graph::PLATFORM_FILTERS;
use crate::firewall::store::{
    Protocol, ProviderRule, SecurityGroupRule, SecurityGroupStore, StoreError,
};
use crate::firewall::FilterObject;
use crate::host_state::{CapacityStore, ComputeNode, HostStateError, ServiceRecord};
use crate::hypervisor::{
    CpuInfo, CpuTopology, DomainDisk, Hypervisor, HypervisorError, MigrateFlags,
};
use crate::instance::{FixedIp, Instance, Mapping, Network, NetworkInfo, PowerState, Vif};

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn test_instance() -> Instance {
    Instance {
        id: 1,
        uuid: Uuid::nil(),
        name: Instance::name_for(1),
        project_id: "fake".to_string(),
        user_id: "fake".to_string(),
        image_ref: "1".to_string(),
        kernel_id: None,
        ramdisk_id: None,
        vcpus: 2,
        memory_mb: 2048,
        local_gb: 20,
        swap_mb: 0,
        os_type: Some("linux".to_string()),
        root_device_name: None,
        power_state: PowerState::NoState,
    }
}

/// `count` interfaces, each on its own /24 with `ips_per_vif` addresses.
pub fn network_info(count: usize, ips_per_vif: usize) -> NetworkInfo {
    (0..count)
        .map(|i| {
            let net = i + 1;
            Vif {
                network: Network {
                    bridge: format!("br{i}"),
                    cidr: format!("192.168.{net}.0/24"),
                    cidr_v6: Some(format!("2001:db8:0:{net}::/64")),
                },
                mapping: Mapping {
                    mac: format!("de:ad:be:ef:00:{i:02x}"),
                    ips: (0..ips_per_vif)
                        .map(|j| FixedIp {
                            ip: format!("192.168.{net}.{}", 100 + j),
                            netmask: Some("255.255.255.0".to_string()),
                        })
                        .collect(),
                    ip6s: vec![FixedIp {
                        ip: format!("2001:db8:0:{net}::100"),
                        netmask: Some("64".to_string()),
                    }],
                    gateway: format!("192.168.{net}.1"),
                    gateway6: Some(format!("2001:db8:0:{net}::1")),
                },
            }
        })
        .collect()
}

pub fn sg_rule(
    group: u64,
    protocol: Option<Protocol>,
    from_port: i32,
    to_port: i32,
    cidr: Option<&str>,
) -> SecurityGroupRule {
    SecurityGroupRule {
        id: 0,
        parent_group_id: group,
        protocol,
        from_port,
        to_port,
        cidr: cidr.map(str::to_string),
        grantee_group_id: None,
    }
}

/// A rule admitting every member of `grantee`.
pub fn grant_rule(
    group: u64,
    protocol: Option<Protocol>,
    from_port: i32,
    to_port: i32,
    grantee: u64,
) -> SecurityGroupRule {
    SecurityGroupRule {
        grantee_group_id: Some(grantee),
        ..sg_rule(group, protocol, from_port, to_port, None)
    }
}

#[derive(Clone, Debug)]
pub struct FakeDomain {
    pub descriptor: String,
    pub state: PowerState,
    pub vcpus: u32,
    pub disks: Vec<DomainDisk>,
    pub managed_save: bool,
    pub attached: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationCall {
    pub name: String,
    pub uri: String,
    pub flags: MigrateFlags,
    pub bandwidth: u64,
}

#[derive(Default)]
struct FakeHypervisorState {
    domains: BTreeMap<String, FakeDomain>,
    filters: BTreeMap<String, FilterObject>,
    undefined: usize,
    destroy_fails: bool,
    migration_error: Option<String>,
    migrations: Vec<MigrationCall>,
}

/// A hypervisor that keeps domains and filters in memory.
pub struct FakeHypervisor {
    state: Mutex<FakeHypervisorState>,
}

impl FakeHypervisor {
    /// Starts with the hypervisor's stock filters registered.
    pub fn new() -> Self {
        let mut state = FakeHypervisorState::default();
        for name in PLATFORM_FILTERS {
            state.filters.insert(name.to_string(), FilterObject::new(name));
        }
        Self { state: Mutex::new(state) }
    }

    pub fn add_domain(&self, name: &str, state: PowerState) {
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            FakeDomain {
                descriptor: format!("<domain>\n  <name>{name}</name>\n</domain>\n"),
                state,
                vcpus: 1,
                disks: Vec::new(),
                managed_save: false,
                attached: Vec::new(),
            },
        );
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().unwrap().domains.get(name).cloned()
    }

    pub fn set_disks(&self, name: &str, disks: Vec<DomainDisk>) {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(name) {
            domain.disks = disks;
        }
    }

    pub fn set_managed_save(&self, name: &str) {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(name) {
            domain.managed_save = true;
        }
    }

    /// Makes `destroy_domain` fail for every domain.
    pub fn fail_destroy(&self) {
        self.state.lock().unwrap().destroy_fails = true;
    }

    pub fn fail_migration(&self, reason: &str) {
        self.state.lock().unwrap().migration_error = Some(reason.to_string());
    }

    pub fn migrations(&self) -> Vec<MigrationCall> {
        self.state.lock().unwrap().migrations.clone()
    }

    pub fn undefine_count(&self) -> usize {
        self.state.lock().unwrap().undefined
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.state.lock().unwrap().filters.contains_key(name)
    }

    pub fn filter(&self, name: &str) -> Option<FilterObject> {
        self.state.lock().unwrap().filters.get(name).cloned()
    }

    pub fn filter_count(&self) -> usize {
        self.state.lock().unwrap().filters.len()
    }

    /// Every filter reachable from `name` through references.
    pub fn transitive_references(&self, name: &str) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        let mut seen = BTreeSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(next) = pending.pop() {
            if let Some(filter) = state.filters.get(&next) {
                for reference in &filter.references {
                    if seen.insert(reference.clone()) {
                        pending.push(reference.clone());
                    }
                }
            }
        }
        seen
    }

    fn missing(name: &str) -> HypervisorError {
        HypervisorError::DomainNotFound(name.to_string())
    }
}

fn descriptor_name(descriptor: &str) -> Option<&str> {
    let start = descriptor.find("<name>")? + "<name>".len();
    let end = descriptor[start..].find("</name>")? + start;
    Some(&descriptor[start..end])
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn define_domain(&self, descriptor: &str) -> Result<(), HypervisorError> {
        let name = descriptor_name(descriptor).ok_or(HypervisorError::Operation {
            op: "define",
            reason: "descriptor has no name".to_string(),
        })?;
        let vcpus = descriptor
            .find("<vcpu>")
            .and_then(|i| descriptor[i + 6..].split('<').next())
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(1);
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.entry(name.to_string()).or_insert(FakeDomain {
            descriptor: String::new(),
            state: PowerState::Shutoff,
            vcpus,
            disks: Vec::new(),
            managed_save: false,
            attached: Vec::new(),
        });
        domain.descriptor = descriptor.to_string();
        domain.vcpus = vcpus;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        domain.state = PowerState::Running;
        Ok(())
    }

    async fn domain_state(
        &self,
        name: &str,
    ) -> Result<Option<PowerState>, HypervisorError> {
        Ok(self.state.lock().unwrap().domains.get(name).map(|d| d.state))
    }

    async fn domain_descriptor(&self, name: &str) -> Result<String, HypervisorError> {
        self.domain(name).map(|d| d.descriptor).ok_or_else(|| Self::missing(name))
    }

    async fn domain_disks(&self, name: &str) -> Result<Vec<DomainDisk>, HypervisorError> {
        self.domain(name).map(|d| d.disks).ok_or_else(|| Self::missing(name))
    }

    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.state.lock().unwrap().domains.keys().cloned().collect())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let fails = state.destroy_fails;
        let domain = state.domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        if fails || domain.state != PowerState::Running {
            return Err(HypervisorError::Operation {
                op: "destroy",
                reason: "domain is not running".to_string(),
            });
        }
        domain.state = PowerState::Shutoff;
        Ok(())
    }

    async fn has_managed_save(&self, name: &str) -> Result<bool, HypervisorError> {
        self.domain(name).map(|d| d.managed_save).ok_or_else(|| Self::missing(name))
    }

    async fn remove_managed_save(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        domain.managed_save = false;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get(name).ok_or_else(|| Self::missing(name))?;
        if domain.managed_save {
            return Err(HypervisorError::Operation {
                op: "undefine",
                reason: "domain has a managed save image".to_string(),
            });
        }
        state.domains.remove(name);
        state.undefined += 1;
        Ok(())
    }

    async fn attach_device(&self, name: &str, stanza: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        domain.attached.push(stanza.to_string());
        Ok(())
    }

    async fn detach_disk(&self, name: &str, target: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state.domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        let needle = format!("dev=\"{target}\"");
        let before = domain.attached.len();
        domain.attached.retain(|s| !s.contains(&needle));
        if domain.attached.len() == before {
            return Err(HypervisorError::DiskNotFound {
                domain: name.to_string(),
                disk: target.to_string(),
            });
        }
        Ok(())
    }

    async fn migrate_to_uri(
        &self,
        name: &str,
        uri: &str,
        flags: MigrateFlags,
        bandwidth: u64,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.migrations.push(MigrationCall {
            name: name.to_string(),
            uri: uri.to_string(),
            flags,
            bandwidth,
        });
        if let Some(reason) = state.migration_error.clone() {
            return Err(HypervisorError::Operation { op: "migrate", reason });
        }
        state.domains.remove(name);
        Ok(())
    }

    async fn define_filter(&self, filter: &FilterObject) -> Result<(), HypervisorError> {
        self.state
            .lock()
            .unwrap()
            .filters
            .insert(filter.name.clone(), filter.clone());
        Ok(())
    }

    async fn undefine_filter(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if !state.filters.contains_key(name) {
            return Err(HypervisorError::FilterNotFound(name.to_string()));
        }
        if state.filters.values().any(|f| f.references.iter().any(|r| r == name)) {
            return Err(HypervisorError::Operation {
                op: "nwfilter-undefine",
                reason: format!("filter {name} is in use"),
            });
        }
        state.filters.remove(name);
        Ok(())
    }

    async fn filter_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.has_filter(name))
    }

    async fn hypervisor_type(&self) -> Result<String, HypervisorError> {
        Ok("QEMU".to_string())
    }

    async fn hypervisor_version(&self) -> Result<u64, HypervisorError> {
        Ok(6_002_000)
    }

    async fn cpu_info(&self) -> Result<CpuInfo, HypervisorError> {
        Ok(CpuInfo {
            arch: "x86_64".to_string(),
            model: "Westmere".to_string(),
            vendor: "Intel".to_string(),
            topology: CpuTopology { sockets: 1, cores: 4, threads: 2 },
            features: vec!["vmx".to_string(), "sse4.2".to_string()],
        })
    }

    async fn vcpus_used(&self) -> Result<u32, HypervisorError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .domains
            .values()
            .filter(|d| d.state == PowerState::Running)
            .map(|d| d.vcpus)
            .sum())
    }
}

#[derive(Default)]
struct FakeIptablesState {
    v4: String,
    v6: String,
    restores: usize,
}

/// Answers `iptables-save` with the last restored text per family.
#[derive(Default)]
pub struct FakeIptables {
    state: Mutex<FakeIptablesState>,
}

impl FakeIptables {
    pub fn with_v4(saved: &str) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().v4 = saved.to_string();
        fake
    }

    pub fn v4(&self) -> String {
        self.state.lock().unwrap().v4.clone()
    }

    pub fn v6(&self) -> String {
        self.state.lock().unwrap().v6.clone()
    }

    pub fn restore_count(&self) -> usize {
        self.state.lock().unwrap().restores
    }
}

#[async_trait]
impl ProcessRunner for FakeIptables {
    async fn run(&self, cmd: Cmd) -> Result<CommandOutput, ExecError> {
        let mut state = self.state.lock().unwrap();
        let stdout = match cmd.program.as_str() {
            "iptables-save" => state.v4.clone(),
            "ip6tables-save" => state.v6.clone(),
            "iptables-restore" | "ip6tables-restore" => {
                let text = cmd.stdin.unwrap_or_default();
                if cmd.program.starts_with("ip6") {
                    state.v6 = text;
                } else {
                    state.v4 = text;
                }
                state.restores += 1;
                String::new()
            }
            _ => String::new(),
        };
        Ok(CommandOutput::stdout(stdout))
    }
}

#[derive(Default)]
struct SecurityGroupData {
    rules: Vec<SecurityGroupRule>,
    instance_groups: BTreeMap<u64, Vec<u64>>,
    addresses: BTreeMap<u64, Vec<String>>,
    provider: Vec<ProviderRule>,
}

#[derive(Default)]
pub struct MemorySecurityGroupStore {
    data: Mutex<SecurityGroupData>,
}

impl MemorySecurityGroupStore {
    pub fn add_rule(&self, rule: SecurityGroupRule) {
        self.data.lock().unwrap().rules.push(rule);
    }

    pub fn add_instance(&self, instance_id: u64, groups: &[u64], addresses: &[&str]) {
        let mut data = self.data.lock().unwrap();
        data.instance_groups.insert(instance_id, groups.to_vec());
        data.addresses.insert(
            instance_id,
            addresses.iter().map(|a| a.to_string()).collect(),
        );
    }

    pub fn set_instance_groups(&self, instance_id: u64, groups: &[u64]) {
        self.data
            .lock()
            .unwrap()
            .instance_groups
            .insert(instance_id, groups.to_vec());
    }

    pub fn set_provider_rules(&self, rules: Vec<ProviderRule>) {
        self.data.lock().unwrap().provider = rules;
    }
}

#[async_trait]
impl SecurityGroupStore for MemorySecurityGroupStore {
    async fn security_groups_for_instance(
        &self,
        instance_id: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data.instance_groups.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn rules_for_group(
        &self,
        group_id: u64,
    ) -> Result<Vec<SecurityGroupRule>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .rules
            .iter()
            .filter(|r| r.parent_group_id == group_id)
            .cloned()
            .collect())
    }

    async fn group_members(&self, group_id: u64) -> Result<Vec<u64>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .instance_groups
            .iter()
            .filter(|(_, groups)| groups.contains(&group_id))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn fixed_addresses(&self, instance_id: u64) -> Result<Vec<String>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data.addresses.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn provider_rules(&self) -> Result<Vec<ProviderRule>, StoreError> {
        Ok(self.data.lock().unwrap().provider.clone())
    }
}

#[derive(Default)]
struct CapacityData {
    services: BTreeMap<String, ServiceRecord>,
    nodes: BTreeMap<u64, ComputeNode>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryCapacityStore {
    data: Mutex<CapacityData>,
}

impl MemoryCapacityStore {
    pub fn add_service(&self, host: &str, service_id: u64) {
        self.data.lock().unwrap().services.insert(
            host.to_string(),
            ServiceRecord { id: service_id, compute_node_id: None },
        );
    }

    pub fn node(&self, id: u64) -> Option<ComputeNode> {
        self.data.lock().unwrap().nodes.get(&id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.data.lock().unwrap().nodes.len()
    }

    pub fn writes(&self) -> usize {
        self.data.lock().unwrap().writes
    }
}

#[async_trait]
impl CapacityStore for MemoryCapacityStore {
    async fn service_for_host(
        &self,
        host: &str,
    ) -> Result<Option<ServiceRecord>, HostStateError> {
        Ok(self.data.lock().unwrap().services.get(host).cloned())
    }

    async fn create_compute_node(&self, node: &ComputeNode) -> Result<u64, HostStateError> {
        let mut data = self.data.lock().unwrap();
        let id = data.nodes.len() as u64 + 1;
        data.nodes.insert(id, node.clone());
        for service in data.services.values_mut() {
            if service.id == node.service_id {
                service.compute_node_id = Some(id);
            }
        }
        data.writes += 1;
        Ok(id)
    }

    async fn update_compute_node(
        &self,
        id: u64,
        node: &ComputeNode,
    ) -> Result<(), HostStateError> {
        let mut data = self.data.lock().unwrap();
        data.nodes.insert(id, node.clone());
        data.writes += 1;
        Ok(())
    }
}

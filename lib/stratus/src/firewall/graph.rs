// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Isolation through filter objects registered with the hypervisor.
//!
//! Filters form a DAG: an instance's per-NIC filter references a shared base
//! filter and a per-instance container, which in turn references the
//! security-group filters. A filter is only ever registered once everything
//! it references is already present in the hypervisor's registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, info, Logger};
use stratus_config::Config;
use tokio::sync::Mutex;

use super::store::{Protocol, SecurityGroupRule, SecurityGroupStore};
use super::{FirewallDriver, FirewallError};
use crate::cidr::Cidr;
use crate::descriptor::Element;
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::instance::{Instance, NetworkInfo};

/// Filters shipped with the hypervisor itself.
pub const PLATFORM_FILTERS: [&str; 4] = [
    "no-mac-spoofing",
    "no-ip-spoofing",
    "no-arp-spoofing",
    "allow-dhcp-server",
];

const SECGROUP_PRIORITY: u32 = 300;

/// Name of the filter attached to one NIC of an instance.
pub fn nic_filter_name(prefix: &str, instance_name: &str, nic_id: &str) -> String {
    format!("{prefix}-instance-{instance_name}-{nic_id}")
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterObject {
    pub name: String,
    pub chain: Option<String>,
    pub references: Vec<String>,
    pub rules: Vec<Element>,
}

impl FilterObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn chain(mut self, chain: &str) -> Self {
        self.chain = Some(chain.to_string());
        self
    }

    pub fn reference(mut self, name: impl Into<String>) -> Self {
        self.references.push(name.into());
        self
    }

    pub fn rule(mut self, rule: Element) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn to_element(&self) -> Element {
        let mut filter = Element::new("filter").attr("name", &self.name);
        if let Some(chain) = &self.chain {
            filter = filter.attr("chain", chain);
        }
        filter
            .children(
                self.references
                    .iter()
                    .map(|r| Element::new("filterref").attr("filter", r)),
            )
            .children(self.rules.iter().cloned())
    }
}

fn rule(action: &str, direction: &str, priority: u32, matcher: Element) -> Element {
    Element::new("rule")
        .attr("action", action)
        .attr("direction", direction)
        .attr("priority", priority)
        .child(matcher)
}

pub struct FilterGraph {
    prefix: String,
    use_ipv6: bool,
    allow_same_net_traffic: bool,
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn SecurityGroupStore>,
    statics_defined: Mutex<bool>,
    log: Logger,
}

impl FilterGraph {
    pub fn new(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<dyn SecurityGroupStore>,
        log: &Logger,
    ) -> Self {
        Self {
            prefix: config.firewall.binary_name.clone(),
            use_ipv6: config.network.use_ipv6,
            allow_same_net_traffic: config.network.allow_same_net_traffic,
            hypervisor,
            store,
            statics_defined: Mutex::new(false),
            log: log.new(slog::o!("component" => "filter-graph")),
        }
    }

    fn named(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.prefix)
    }

    fn container_name(&self, instance: &Instance) -> String {
        self.named(&format!("instance-{}-secgroup", instance.name))
    }

    fn nic_filters<'a>(
        &'a self,
        instance: &'a Instance,
        network_info: &'a NetworkInfo,
    ) -> impl Iterator<Item = String> + 'a {
        network_info.iter().map(move |vif| {
            nic_filter_name(&self.prefix, &instance.name, &vif.mapping.nic_id())
        })
    }

    /// Registers `filter`, refusing if any filter it references is absent.
    pub async fn define_filter(&self, filter: &FilterObject) -> Result<(), FirewallError> {
        for reference in &filter.references {
            if !self.hypervisor.filter_exists(reference).await? {
                return Err(FirewallError::MissingDependency {
                    filter: filter.name.clone(),
                    missing: reference.clone(),
                });
            }
        }
        self.hypervisor.define_filter(filter).await?;
        debug!(self.log, "defined filter"; "filter" => &filter.name);
        Ok(())
    }

    /// The agent's own shared filters, in registration order.
    pub fn static_filters(&self) -> Vec<FilterObject> {
        let mut filters = vec![
            FilterObject::new(self.named("base"))
                .chain("root")
                .reference("no-mac-spoofing")
                .reference("no-ip-spoofing")
                .reference("no-arp-spoofing")
                .reference("allow-dhcp-server"),
            FilterObject::new(self.named("vpn"))
                .chain("root")
                .reference("allow-dhcp-server"),
            self.base_protocol_filter(false),
            self.base_protocol_filter(true),
            FilterObject::new(self.named("allow-dhcp-server"))
                .chain("ipv4")
                .rule(rule(
                    "accept",
                    "out",
                    100,
                    Element::new("udp")
                        .attr("srcipaddr", "0.0.0.0")
                        .attr("dstipaddr", "255.255.255.255")
                        .attr("srcportstart", 68)
                        .attr("dstportstart", 67),
                ))
                .rule(rule(
                    "accept",
                    "in",
                    100,
                    Element::new("udp")
                        .attr("srcipaddr", "$DHCPSERVER")
                        .attr("srcportstart", 67)
                        .attr("dstportstart", 68),
                )),
            FilterObject::new(self.named("allow-ra-server")).chain("root").rule(rule(
                "accept",
                "inout",
                100,
                Element::new("icmpv6").attr("srcipaddr", "$RASERVER"),
            )),
        ];
        if self.allow_same_net_traffic {
            filters.push(FilterObject::new(self.named("project")).chain("ipv4").rule(
                rule(
                    "accept",
                    "in",
                    200,
                    Element::new("ip")
                        .attr("srcipaddr", "$PROJNET")
                        .attr("srcipmask", "$PROJMASK"),
                ),
            ));
            if self.use_ipv6 {
                filters.push(
                    FilterObject::new(self.named("project-v6")).chain("root").rule(
                        rule(
                            "accept",
                            "inout",
                            200,
                            Element::new("ipv6")
                                .attr("srcipaddr", "$PROJNETV6")
                                .attr("srcipmask", "$PROJMASKV6"),
                        ),
                    ),
                );
            }
        }
        filters
    }

    fn base_protocol_filter(&self, v6: bool) -> FilterObject {
        let (name, chain, protocols) = if v6 {
            ("base-ipv6", "ipv6", ["tcp-ipv6", "udp-ipv6", "icmpv6"])
        } else {
            ("base-ipv4", "ipv4", ["tcp", "udp", "icmp"])
        };
        protocols.into_iter().fold(
            FilterObject::new(self.named(name)).chain(chain),
            |filter, proto| {
                filter
                    .rule(rule("accept", "out", 399, Element::new(proto)))
                    .rule(rule("drop", "in", 400, Element::new(proto)))
            },
        )
    }

    async fn ensure_static_filters(&self) -> Result<(), FirewallError> {
        let mut defined = self.statics_defined.lock().await;
        if *defined {
            return Ok(());
        }
        for filter in self.static_filters() {
            self.define_filter(&filter).await?;
        }
        *defined = true;
        Ok(())
    }

    /// Filters for one security group: per-protocol children first, then
    /// the root that references them.
    pub async fn security_group_filters(
        &self,
        group_id: u64,
    ) -> Result<Vec<FilterObject>, FirewallError> {
        let mut children: BTreeMap<String, Vec<Element>> = BTreeMap::new();
        for sg_rule in self.store.rules_for_group(group_id).await? {
            // Grants by group carry no address to match on here.
            let Some(cidr) = &sg_rule.cidr else {
                continue;
            };
            let cidr: Cidr = cidr.parse()?;
            let (proto, matcher) = secgroup_matcher(&sg_rule, &cidr);
            children.entry(proto).or_default().push(rule(
                "accept",
                "in",
                SECGROUP_PRIORITY,
                matcher,
            ));
        }

        let root_name = self.named(&format!("secgroup-{group_id}"));
        let mut root = FilterObject::new(&root_name)
            .chain(if self.use_ipv6 { "root" } else { "ipv4" });
        let mut filters = Vec::with_capacity(children.len() + 1);
        for (proto, rules) in children {
            let child = rules.into_iter().fold(
                FilterObject::new(format!("{root_name}-{proto}")),
                FilterObject::rule,
            );
            root = root.reference(&child.name);
            filters.push(child);
        }
        filters.push(root);
        Ok(filters)
    }

    async fn define_security_group(&self, group_id: u64) -> Result<(), FirewallError> {
        for filter in self.security_group_filters(group_id).await? {
            self.define_filter(&filter).await?;
        }
        Ok(())
    }

    async fn undefine_ignoring_missing(&self, name: &str) -> Result<bool, FirewallError> {
        match self.hypervisor.undefine_filter(name).await {
            Ok(()) => Ok(true),
            Err(HypervisorError::FilterNotFound(_)) => {
                debug!(self.log, "filter already gone"; "filter" => name);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn secgroup_matcher(sg_rule: &SecurityGroupRule, cidr: &Cidr) -> (String, Element) {
    let v6 = cidr.is_ipv6();
    let proto = match (sg_rule.protocol, v6) {
        (Some(Protocol::Icmp), true) => "icmpv6".to_string(),
        (Some(p), true) => format!("{p}-ipv6"),
        (Some(p), false) => p.to_string(),
        (None, true) => "all-ipv6".to_string(),
        (None, false) => "all".to_string(),
    };
    let mask = match cidr.netmask() {
        Some(mask) => mask.to_string(),
        None => cidr.prefix().to_string(),
    };
    let mut matcher = Element::new(&proto)
        .attr("srcipaddr", cidr.addr())
        .attr("srcipmask", mask);
    match sg_rule.protocol {
        Some(Protocol::Tcp | Protocol::Udp) => {
            matcher = matcher
                .attr("dstportstart", sg_rule.from_port)
                .attr("dstportend", sg_rule.to_port);
        }
        Some(Protocol::Icmp) => {
            if sg_rule.from_port != -1 {
                matcher = matcher.attr("type", sg_rule.from_port);
            }
            if sg_rule.to_port != -1 {
                matcher = matcher.attr("code", sg_rule.to_port);
            }
        }
        None => {}
    }
    (proto, matcher)
}

#[async_trait]
impl FirewallDriver for FilterGraph {
    async fn prepare_instance_filter(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        self.ensure_static_filters().await?;

        let groups = self.store.security_groups_for_instance(instance.id).await?;
        for group in &groups {
            self.define_security_group(*group).await?;
        }

        let mut container = FilterObject::new(self.container_name(instance))
            .chain("root")
            .reference(self.named("base-ipv4"))
            .reference(self.named("base-ipv6"))
            .reference(self.named("allow-dhcp-server"));
        if self.use_ipv6 {
            container = container.reference(self.named("allow-ra-server"));
        }
        for group in &groups {
            container = container.reference(self.named(&format!("secgroup-{group}")));
        }
        self.define_filter(&container).await?;

        for name in self.nic_filters(instance, network_info) {
            let mut nic = FilterObject::new(name)
                .chain("root")
                .reference(self.named("base"))
                .reference(&container.name);
            if self.allow_same_net_traffic {
                nic = nic.reference(self.named("project"));
                if self.use_ipv6 {
                    nic = nic.reference(self.named("project-v6"));
                }
            }
            self.define_filter(&nic).await?;
        }
        info!(self.log, "prepared instance filters";
            "instance" => &instance.name, "groups" => groups.len());
        Ok(())
    }

    async fn apply_instance_filter(
        &self,
        _instance: &Instance,
        _network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        // Registration in prepare is already live.
        Ok(())
    }

    async fn unfilter_instance(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        for name in self.nic_filters(instance, network_info) {
            self.undefine_ignoring_missing(&name).await?;
        }
        self.undefine_ignoring_missing(&self.container_name(instance)).await?;
        info!(self.log, "removed instance filters"; "instance" => &instance.name);
        Ok(())
    }

    async fn setup_basic_filtering(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        self.ensure_static_filters().await?;
        for name in self.nic_filters(instance, network_info) {
            let nic = FilterObject::new(name).chain("root").reference(self.named("base"));
            self.define_filter(&nic).await?;
        }
        Ok(())
    }

    async fn refresh_security_group_rules(
        &self,
        security_group_id: u64,
    ) -> Result<(), FirewallError> {
        self.define_security_group(security_group_id).await
    }

    async fn refresh_security_group_members(
        &self,
        _security_group_id: u64,
    ) -> Result<(), FirewallError> {
        // Group filters only carry CIDR rules, so membership is irrelevant.
        Ok(())
    }

    async fn refresh_provider_fw_rules(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn instance_filter_exists(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<bool, FirewallError> {
        for name in self.nic_filters(instance, network_info) {
            if !self.hypervisor.filter_exists(&name).await? {
                debug!(self.log, "instance filter missing";
                    "instance" => &instance.name, "filter" => &name);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Isolation through iptables chains on the host.
//!
//! Each filtered instance owns one `inst-<id>` chain per address family,
//! reached from the wrapped `local` chain by destination address. That chain
//! jumps to the shared `provider` chain, to one `sg-<id>` chain per security
//! group, and finally to `sg-fallback`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, info, Logger};
use stratus_config::Config;
use tokio::sync::Mutex;

use super::graph::FilterGraph;
use super::iptables::{Family, IptablesManager};
use super::store::{Protocol, SecurityGroupRule, SecurityGroupStore};
use super::{FirewallDriver, FirewallError};
use crate::cidr::Cidr;
use crate::exec::ProcessRunner;
use crate::hypervisor::Hypervisor;
use crate::instance::{Instance, NetworkInfo};

const PROVIDER_CHAIN: &str = "provider";
const FALLBACK_CHAIN: &str = "sg-fallback";

fn instance_chain(id: u64) -> String {
    format!("inst-{id}")
}

fn group_chain(id: u64) -> String {
    format!("sg-{id}")
}

fn family_of(cidr: &Cidr) -> Family {
    if cidr.is_ipv6() {
        Family::V6
    } else {
        Family::V4
    }
}

/// Rules split by address family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct FamilyRules {
    v4: Vec<String>,
    v6: Vec<String>,
}

impl FamilyRules {
    fn get(&self, family: Family) -> &[String] {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    fn push(&mut self, family: Family, rule: String) {
        match family {
            Family::V4 => self.v4.push(rule),
            Family::V6 => self.v6.push(rule),
        }
    }
}

/// Everything computed for one instance, waiting to be installed.
#[derive(Clone, Debug, Default)]
struct StagedFilter {
    instance: FamilyRules,
    groups: BTreeMap<u64, FamilyRules>,
}

struct ChainState {
    iptables: IptablesManager,
    instances: BTreeMap<u64, (Instance, NetworkInfo, Vec<u64>)>,
    staged: BTreeMap<u64, StagedFilter>,
}

pub struct ChainFilter {
    allow_same_net_traffic: bool,
    graph: FilterGraph,
    store: Arc<dyn SecurityGroupStore>,
    state: Mutex<ChainState>,
    provider_primed: Mutex<bool>,
    log: Logger,
}

impl ChainFilter {
    pub fn new(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn SecurityGroupStore>,
        log: &Logger,
    ) -> Self {
        let log = log.new(slog::o!("component" => "chain-filter"));
        let mut iptables = IptablesManager::new(
            &config.firewall.binary_name,
            config.network.use_ipv6,
            runner,
            &log,
        );
        for family in [Family::V4, Family::V6] {
            let table = iptables.table_mut(family);
            table.add_chain(PROVIDER_CHAIN, true);
            table.add_chain(FALLBACK_CHAIN, true);
            table.add_rule(FALLBACK_CHAIN, "-j DROP", true, false);
        }
        Self {
            allow_same_net_traffic: config.network.allow_same_net_traffic,
            graph: FilterGraph::new(config, hypervisor, store.clone(), &log),
            store,
            state: Mutex::new(ChainState {
                iptables,
                instances: BTreeMap::new(),
                staged: BTreeMap::new(),
            }),
            provider_primed: Mutex::new(false),
            log,
        }
    }

    async fn compute(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(Vec<u64>, StagedFilter), FirewallError> {
        let groups = self.store.security_groups_for_instance(instance.id).await?;
        let mut staged = StagedFilter {
            instance: self.instance_rules(network_info, &groups)?,
            groups: BTreeMap::new(),
        };
        for group in &groups {
            staged.groups.insert(*group, self.group_rules(*group).await?);
        }
        Ok((groups, staged))
    }

    fn instance_rules(
        &self,
        network_info: &NetworkInfo,
        groups: &[u64],
    ) -> Result<FamilyRules, FirewallError> {
        let common = [
            "-m state --state INVALID -j DROP".to_string(),
            "-m state --state ESTABLISHED,RELATED -j ACCEPT".to_string(),
            format!("-j ${PROVIDER_CHAIN}"),
        ];
        let mut rules = FamilyRules { v4: common.to_vec(), v6: common.to_vec() };

        for vif in network_info {
            rules.v4.push(format!(
                "-s {} -p udp --sport 67 --dport 68 -j ACCEPT",
                vif.mapping.gateway
            ));
            if let Some(gw6) = &vif.mapping.gateway6 {
                rules.v6.push(format!("-s {gw6}/128 -p icmpv6 -j ACCEPT"));
            }
        }
        if self.allow_same_net_traffic {
            for vif in network_info {
                let cidr: Cidr = vif.network.cidr.parse()?;
                rules.v4.push(format!("-s {cidr} -j ACCEPT"));
                if let Some(v6) = &vif.network.cidr_v6 {
                    let cidr: Cidr = v6.parse()?;
                    rules.v6.push(format!("-s {cidr} -j ACCEPT"));
                }
            }
        }
        for group in groups {
            let jump = format!("-j ${}", group_chain(*group));
            rules.v4.push(jump.clone());
            rules.v6.push(jump);
        }
        let fallback = format!("-j ${FALLBACK_CHAIN}");
        rules.v4.push(fallback.clone());
        rules.v6.push(fallback);

        for family_rules in [&mut rules.v4, &mut rules.v6] {
            let mut seen = BTreeSet::new();
            family_rules.retain(|r| seen.insert(r.clone()));
        }
        Ok(rules)
    }

    async fn group_rules(&self, group_id: u64) -> Result<FamilyRules, FirewallError> {
        let mut rules = FamilyRules::default();
        for sg_rule in self.store.rules_for_group(group_id).await? {
            let sources: Vec<Cidr> = match (&sg_rule.cidr, sg_rule.grantee_group_id) {
                (Some(cidr), _) => vec![cidr.parse::<Cidr>()?],
                (None, Some(grantee)) => {
                    let mut sources = Vec::new();
                    for member in self.store.group_members(grantee).await? {
                        for ip in self.store.fixed_addresses(member).await? {
                            sources.push(ip.parse::<Cidr>()?);
                        }
                    }
                    sources
                }
                (None, None) => continue,
            };
            for source in sources {
                let family = family_of(&source);
                let mut args = vec!["-j ACCEPT".to_string()];
                args.extend(protocol_args(&sg_rule, family));
                args.push(format!("-s {source}"));
                rules.push(family, args.join(" "));
            }
        }
        Ok(rules)
    }

    fn install(
        iptables: &mut IptablesManager,
        instance: &Instance,
        network_info: &NetworkInfo,
        staged: &StagedFilter,
    ) {
        let chain = instance_chain(instance.id);
        for &family in iptables.families() {
            let table = iptables.table_mut(family);
            table.remove_chain(&chain, true);

            for (group, rules) in &staged.groups {
                let name = group_chain(*group);
                table.add_chain(&name, true);
                table.empty_chain(&name, true);
                for rule in rules.get(family) {
                    table.add_rule(&name, rule, true, false);
                }
            }

            table.add_chain(&chain, true);
            for rule in staged.instance.get(family) {
                table.add_rule(&chain, rule, true, false);
            }
            for vif in network_info {
                let ips = match family {
                    Family::V4 => &vif.mapping.ips,
                    Family::V6 => &vif.mapping.ip6s,
                };
                for ip in ips {
                    table.add_rule("local", &format!("-d {} -j ${chain}", ip.ip), true, false);
                }
            }
        }
    }

    /// Recomputes every filtered instance and drops group chains nothing
    /// jumps to anymore.
    async fn refresh_all(&self) -> Result<(), FirewallError> {
        let mut state = self.state.lock().await;
        let entries: Vec<(Instance, NetworkInfo)> = state
            .instances
            .values()
            .map(|(instance, nets, _)| (instance.clone(), nets.clone()))
            .collect();

        let mut recomputed = Vec::with_capacity(entries.len());
        for (instance, nets) in entries {
            let (groups, staged) = self.compute(&instance, &nets).await?;
            recomputed.push((instance, nets, groups, staged));
        }

        let referenced: BTreeSet<String> = recomputed
            .iter()
            .flat_map(|(_, _, groups, _)| groups.iter().map(|g| group_chain(*g)))
            .collect();
        for family in [Family::V4, Family::V6] {
            let table = state.iptables.table_mut(family);
            let stale: Vec<String> = table
                .chains()
                .filter(|c| c.starts_with("sg-") && *c != FALLBACK_CHAIN)
                .filter(|c| !referenced.contains(*c))
                .map(str::to_string)
                .collect();
            for chain in stale {
                table.remove_chain(&chain, true);
            }
        }

        for (instance, nets, groups, staged) in recomputed {
            Self::install(&mut state.iptables, &instance, &nets, &staged);
            state.instances.insert(instance.id, (instance, nets, groups));
        }
        state.iptables.apply().await
    }
}

/// Protocol and port matchers shared by group and provider rules.
fn protocol_args(rule: &SecurityGroupRule, family: Family) -> Vec<String> {
    let Some(protocol) = rule.protocol else {
        return Vec::new();
    };
    port_args(protocol, rule.from_port, rule.to_port, family)
}

fn port_args(protocol: Protocol, from: i32, to: i32, family: Family) -> Vec<String> {
    match protocol {
        Protocol::Tcp | Protocol::Udp => {
            let ports = if from == to {
                format!("--dport {from}")
            } else {
                format!("-m multiport --dports {from}:{to}")
            };
            vec![format!("-p {protocol}"), ports]
        }
        Protocol::Icmp => {
            let (name, matcher) = match family {
                Family::V4 => ("icmp", "-m icmp --icmp-type"),
                Family::V6 => ("icmpv6", "-m icmp6 --icmpv6-type"),
            };
            let mut args = vec![format!("-p {name}")];
            if from != -1 {
                let icmp_type = if to == -1 {
                    from.to_string()
                } else {
                    format!("{from}/{to}")
                };
                args.push(format!("{matcher} {icmp_type}"));
            }
            args
        }
    }
}

#[async_trait]
impl FirewallDriver for ChainFilter {
    async fn prepare_instance_filter(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        let (_, staged) = self.compute(instance, network_info).await?;
        self.state.lock().await.staged.insert(instance.id, staged);
        debug!(self.log, "staged instance rules"; "instance" => &instance.name);
        Ok(())
    }

    async fn apply_instance_filter(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        let staged = self.state.lock().await.staged.remove(&instance.id);
        let staged = match staged {
            Some(staged) => staged,
            None => self.compute(instance, network_info).await?.1,
        };
        let groups = staged.groups.keys().copied().collect();
        let mut state = self.state.lock().await;
        Self::install(&mut state.iptables, instance, network_info, &staged);
        state
            .instances
            .insert(instance.id, (instance.clone(), network_info.clone(), groups));
        state.iptables.apply().await?;
        info!(self.log, "applied instance filter"; "instance" => &instance.name);
        Ok(())
    }

    async fn unfilter_instance(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        {
            let mut state = self.state.lock().await;
            state.staged.remove(&instance.id);
            if state.instances.remove(&instance.id).is_some() {
                let chain = instance_chain(instance.id);
                for family in [Family::V4, Family::V6] {
                    state.iptables.table_mut(family).remove_chain(&chain, true);
                }
                state.iptables.apply().await?;
            } else {
                info!(self.log, "instance was not filtered"; "instance" => &instance.name);
            }
        }
        self.graph.unfilter_instance(instance, network_info).await
    }

    async fn setup_basic_filtering(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<(), FirewallError> {
        self.graph.setup_basic_filtering(instance, network_info).await?;
        let mut primed = self.provider_primed.lock().await;
        if !*primed {
            self.refresh_provider_fw_rules().await?;
            *primed = true;
        }
        Ok(())
    }

    async fn refresh_security_group_rules(
        &self,
        security_group_id: u64,
    ) -> Result<(), FirewallError> {
        debug!(self.log, "refreshing group rules"; "group" => security_group_id);
        self.refresh_all().await
    }

    async fn refresh_security_group_members(
        &self,
        security_group_id: u64,
    ) -> Result<(), FirewallError> {
        debug!(self.log, "refreshing group members"; "group" => security_group_id);
        self.refresh_all().await
    }

    async fn refresh_provider_fw_rules(&self) -> Result<(), FirewallError> {
        let rules = self.store.provider_rules().await?;
        let mut state = self.state.lock().await;
        for family in [Family::V4, Family::V6] {
            state.iptables.table_mut(family).empty_chain(PROVIDER_CHAIN, true);
        }
        for rule in &rules {
            let cidr: Cidr = rule.cidr.parse()?;
            let family = family_of(&cidr);
            let mut args = port_args(rule.protocol, rule.from_port, rule.to_port, family);
            args.insert(1, format!("-s {cidr}"));
            args.push("-j DROP".to_string());
            state
                .iptables
                .table_mut(family)
                .add_rule(PROVIDER_CHAIN, &args.join(" "), true, false);
        }
        state.iptables.apply().await?;
        debug!(self.log, "refreshed provider rules"; "count" => rules.len());
        Ok(())
    }

    async fn instance_filter_exists(
        &self,
        instance: &Instance,
        network_info: &NetworkInfo,
    ) -> Result<bool, FirewallError> {
        self.graph.instance_filter_exists(instance, network_info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::firewall::store::ProviderRule;
    use crate::testutil::{
        grant_rule, network_info, sg_rule, test_instance, test_logger,
        FakeHypervisor, FakeIptables, MemorySecurityGroupStore,
    };

    struct Harness {
        fw: ChainFilter,
        iptables: Arc<FakeIptables>,
        hypervisor: Arc<FakeHypervisor>,
        store: Arc<MemorySecurityGroupStore>,
    }

    fn harness(config: Config) -> Harness {
        let iptables = Arc::new(FakeIptables::with_v4(""));
        let hypervisor = Arc::new(FakeHypervisor::new());
        let store = Arc::new(MemorySecurityGroupStore::default());
        let fw = ChainFilter::new(
            &config,
            hypervisor.clone(),
            iptables.clone(),
            store.clone(),
            &test_logger(),
        );
        Harness { fw, iptables, hypervisor, store }
    }

    async fn rules_in(fw: &ChainFilter, family: Family, chain: &str) -> Vec<String> {
        let state = fw.state.lock().await;
        state
            .iptables
            .table(family)
            .rules_in(chain)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn chains(fw: &ChainFilter, family: Family) -> Vec<String> {
        let state = fw.state.lock().await;
        state.iptables.table(family).chains().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn instance_chain_is_built_in_order() {
        let h = harness(Config::default());
        h.store.add_rule(sg_rule(5, Some(Protocol::Tcp), 22, 22, Some("10.0.0.0/8")));
        h.store.add_rule(sg_rule(5, Some(Protocol::Icmp), 8, -1, Some("0.0.0.0/0")));
        h.store.add_rule(sg_rule(5, Some(Protocol::Udp), 1000, 2000, Some("10.0.0.0/8")));
        h.store.add_instance(1, &[5], &["192.168.1.100"]);
        let instance = test_instance();
        let nets = network_info(1, 1);

        h.fw.prepare_instance_filter(&instance, &nets).await.unwrap();
        h.fw.apply_instance_filter(&instance, &nets).await.unwrap();

        assert_eq!(
            rules_in(&h.fw, Family::V4, "inst-1").await,
            [
                "-m state --state INVALID -j DROP",
                "-m state --state ESTABLISHED,RELATED -j ACCEPT",
                "-j $provider",
                "-s 192.168.1.1 -p udp --sport 67 --dport 68 -j ACCEPT",
                "-s 192.168.1.0/24 -j ACCEPT",
                "-j $sg-5",
                "-j $sg-fallback",
            ]
        );
        assert_eq!(
            rules_in(&h.fw, Family::V4, "sg-5").await,
            [
                "-j ACCEPT -p tcp --dport 22 -s 10.0.0.0/8",
                "-j ACCEPT -p icmp -m icmp --icmp-type 8 -s 0.0.0.0/0",
                "-j ACCEPT -p udp -m multiport --dports 1000:2000 -s 10.0.0.0/8",
            ]
        );
        assert_eq!(
            rules_in(&h.fw, Family::V4, "local").await,
            ["-d 192.168.1.100 -j $inst-1"]
        );

        let live = h.iptables.v4();
        assert!(live.contains("-A stratus-agent-local -d 192.168.1.100 -j stratus-agent-inst-1"));
        assert!(live.contains("-A stratus-agent-sg-5 -j ACCEPT -p tcp --dport 22 -s 10.0.0.0/8"));
    }

    #[tokio::test]
    async fn prepare_does_not_touch_tables() {
        let h = harness(Config::default());
        h.store.add_instance(1, &[], &["192.168.1.100"]);
        let instance = test_instance();
        let nets = network_info(1, 1);

        h.fw.prepare_instance_filter(&instance, &nets).await.unwrap();
        assert!(!chains(&h.fw, Family::V4).await.contains(&"inst-1".to_string()));
        assert!(h.iptables.v4().is_empty());
    }

    #[tokio::test]
    async fn group_grants_expand_per_member_address() {
        let h = harness(Config::default());
        h.store.add_rule(grant_rule(2, Some(Protocol::Tcp), 80, 80, 3));
        h.store.add_instance(1, &[2], &["192.168.1.100"]);
        let members = ["10.0.0.5", "10.0.0.6", "10.0.0.7"];
        for (i, ip) in members.into_iter().enumerate() {
            h.store.add_instance(10 + i as u64, &[3], &[ip]);
        }
        let instance = test_instance();
        let nets = network_info(1, 1);

        h.fw.apply_instance_filter(&instance, &nets).await.unwrap();
        let rules = rules_in(&h.fw, Family::V4, "sg-2").await;
        assert_eq!(rules.len(), members.len());
        for ip in members {
            assert!(rules.contains(&format!("-j ACCEPT -p tcp --dport 80 -s {ip}/32")));
        }

        h.store.add_instance(20, &[3], &["10.0.0.8"]);
        h.fw.refresh_security_group_members(3).await.unwrap();
        assert_eq!(rules_in(&h.fw, Family::V4, "sg-2").await.len(), 4);
    }

    #[tokio::test]
    async fn ipv6_rules_only_with_ipv6_enabled() {
        let h = harness(Config::default());
        h.store.add_rule(sg_rule(5, Some(Protocol::Icmp), 128, -1, Some("2001:db8::/32")));
        h.store.add_instance(1, &[5], &["192.168.1.100"]);
        let instance = test_instance();
        let nets = network_info(1, 1);
        h.fw.apply_instance_filter(&instance, &nets).await.unwrap();
        assert!(!chains(&h.fw, Family::V6).await.contains(&"inst-1".to_string()));
        assert!(h.iptables.v6().is_empty());

        let mut config = Config::default();
        config.network.use_ipv6 = true;
        let h6 = harness(config);
        h6.store.add_rule(sg_rule(5, Some(Protocol::Icmp), 128, -1, Some("2001:db8::/32")));
        h6.store.add_instance(1, &[5], &["192.168.1.100"]);
        h6.fw.apply_instance_filter(&instance, &nets).await.unwrap();

        let v6 = rules_in(&h6.fw, Family::V6, "inst-1").await;
        assert!(v6.contains(&"-s 2001:db8:0:1::1/128 -p icmpv6 -j ACCEPT".to_string()));
        assert!(v6.contains(&"-s 2001:db8:0:1::/64 -j ACCEPT".to_string()));
        assert_eq!(
            rules_in(&h6.fw, Family::V6, "sg-5").await,
            ["-j ACCEPT -p icmpv6 -m icmp6 --icmpv6-type 128 -s 2001:db8::/32"]
        );
        assert!(rules_in(&h6.fw, Family::V4, "sg-5").await.is_empty());
        assert!(h6.iptables.v6().contains("stratus-agent-inst-1"));
    }

    #[tokio::test]
    async fn unfilter_removes_only_the_instance_chain() {
        let h = harness(Config::default());
        h.store.add_rule(sg_rule(5, Some(Protocol::Tcp), 22, 22, Some("10.0.0.0/8")));
        h.store.add_instance(1, &[5], &["192.168.1.100"]);
        let instance = test_instance();
        let nets = network_info(1, 1);

        h.fw.setup_basic_filtering(&instance, &nets).await.unwrap();
        h.fw.apply_instance_filter(&instance, &nets).await.unwrap();
        let before = chains(&h.fw, Family::V4).await;

        h.fw.unfilter_instance(&instance, &nets).await.unwrap();
        let after = chains(&h.fw, Family::V4).await;
        assert_eq!(before.len() - after.len(), 1);
        assert!(after.contains(&"sg-5".to_string()));
        assert!(rules_in(&h.fw, Family::V4, "local").await.is_empty());
        assert!(!h.iptables.v4().contains("inst-1"));
        assert!(!h.fw.instance_filter_exists(&instance, &nets).await.unwrap());
    }

    #[tokio::test]
    async fn provider_refresh_is_idempotent() {
        let h = harness(Config::default());
        h.store.set_provider_rules(vec![
            ProviderRule {
                protocol: Protocol::Tcp,
                from_port: 1,
                to_port: 65535,
                cidr: "10.99.99.99/32".to_string(),
            },
            ProviderRule {
                protocol: Protocol::Icmp,
                from_port: -1,
                to_port: -1,
                cidr: "10.99.99.0/24".to_string(),
            },
        ]);

        h.fw.refresh_provider_fw_rules().await.unwrap();
        let first = rules_in(&h.fw, Family::V4, "provider").await;
        assert_eq!(
            first,
            [
                "-p tcp -s 10.99.99.99/32 -m multiport --dports 1:65535 -j DROP",
                "-p icmp -s 10.99.99.0/24 -j DROP",
            ]
        );

        h.fw.refresh_provider_fw_rules().await.unwrap();
        assert_eq!(rules_in(&h.fw, Family::V4, "provider").await, first);

        h.store.set_provider_rules(Vec::new());
        h.fw.refresh_provider_fw_rules().await.unwrap();
        assert!(rules_in(&h.fw, Family::V4, "provider").await.is_empty());
    }

    #[tokio::test]
    async fn basic_filtering_defines_nic_filters_and_primes_provider() {
        let h = harness(Config::default());
        let instance = test_instance();
        let nets = network_info(2, 1);

        h.fw.setup_basic_filtering(&instance, &nets).await.unwrap();
        assert!(h.fw.instance_filter_exists(&instance, &nets).await.unwrap());
        assert!(h.hypervisor.has_filter("stratus-agent-base"));
        assert!(h.iptables.v4().contains(":stratus-agent-provider - [0:0]"));
        assert_eq!(h.iptables.restore_count(), 1);

        h.fw.setup_basic_filtering(&instance, &nets).await.unwrap();
        assert_eq!(h.iptables.restore_count(), 1);
    }

    #[tokio::test]
    async fn refresh_drops_unreferenced_group_chains() {
        let h = harness(Config::default());
        h.store.add_rule(sg_rule(5, Some(Protocol::Tcp), 22, 22, Some("10.0.0.0/8")));
        h.store.add_instance(1, &[5], &["192.168.1.100"]);
        let instance = test_instance();
        let nets = network_info(1, 1);
        h.fw.apply_instance_filter(&instance, &nets).await.unwrap();

        h.store.set_instance_groups(1, &[]);
        h.fw.refresh_security_group_rules(5).await.unwrap();
        let chains = chains(&h.fw, Family::V4).await;
        assert!(!chains.contains(&"sg-5".to_string()));
        assert!(chains.contains(&"sg-fallback".to_string()));
        assert!(!rules_in(&h.fw, Family::V4, "inst-1")
            .await
            .contains(&"-j $sg-5".to_string()));
    }
}

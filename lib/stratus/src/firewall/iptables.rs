// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory iptables tables and their resync against the kernel.
//!
//! Chains added with `wrap` are owned by this agent and are written out as
//! `<binary_name>-<chain>`; rule text may refer to them as `$chain`.
//! Unwrapped chains keep their names verbatim.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use slog::{debug, Logger};

use super::FirewallError;
use crate::exec::{Cmd, ProcessRunner};

/// Shared hook chain jumped to from FORWARD and OUTPUT.
pub const FILTER_TOP: &str = "stratus-filter-top";

#[derive(Clone, Debug, PartialEq, Eq)]
struct Rule {
    chain: String,
    rule: String,
    wrap: bool,
    top: bool,
}

#[derive(Clone, Debug, Default)]
pub struct IptablesTable {
    chains: BTreeSet<String>,
    unwrapped_chains: BTreeSet<String>,
    rules: Vec<Rule>,
}

impl IptablesTable {
    pub fn add_chain(&mut self, name: &str, wrap: bool) {
        if wrap {
            self.chains.insert(name.to_string());
        } else {
            self.unwrapped_chains.insert(name.to_string());
        }
    }

    /// Removes a chain together with its rules and every jump into it.
    pub fn remove_chain(&mut self, name: &str, wrap: bool) {
        let removed = if wrap {
            self.chains.remove(name)
        } else {
            self.unwrapped_chains.remove(name)
        };
        if !removed {
            return;
        }
        let target = if wrap { format!("${name}") } else { name.to_string() };
        self.rules.retain(|r| {
            !(r.chain == name && r.wrap == wrap)
                && !r.rule.split_whitespace().any(|t| t == target)
        });
    }

    pub fn add_rule(&mut self, chain: &str, rule: &str, wrap: bool, top: bool) {
        let rule = Rule {
            chain: chain.to_string(),
            rule: rule.to_string(),
            wrap,
            top,
        };
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    pub fn empty_chain(&mut self, chain: &str, wrap: bool) {
        self.rules.retain(|r| !(r.chain == chain && r.wrap == wrap));
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains(name)
    }

    /// Agent-owned chains, in name order.
    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.iter().map(String::as_str)
    }

    /// Rule bodies of a wrapped chain, in insertion order.
    pub fn rules_in(&self, chain: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.wrap && r.chain == chain)
            .map(|r| r.rule.as_str())
            .collect()
    }

    fn render_rule(rule: &Rule, binary_name: &str) -> String {
        let chain = if rule.wrap {
            format!("{binary_name}-{}", rule.chain)
        } else {
            rule.chain.clone()
        };
        let body = rule
            .rule
            .split(' ')
            .map(|token| match token.strip_prefix('$') {
                Some(target) => format!("{binary_name}-{target}"),
                None => token.to_string(),
            })
            .join(" ");
        format!("-A {chain} {body}")
    }

    /// Folds this table into the text of `iptables-save -t <table>`.
    ///
    /// Lines this agent generated on a previous pass are dropped and
    /// regenerated. Everything else is kept verbatim and in order. Our
    /// chain declarations follow the existing ones, rules marked `top`
    /// come before any existing rule, and the remaining rules are appended
    /// just ahead of `COMMIT`.
    pub fn merge(
        &self,
        saved: &str,
        table: &str,
        binary_name: &str,
    ) -> Result<String, FirewallError> {
        let our_chains: BTreeSet<String> = self
            .unwrapped_chains
            .iter()
            .cloned()
            .chain(self.chains.iter().map(|c| format!("{binary_name}-{c}")))
            .collect();
        let decls: Vec<String> =
            our_chains.iter().map(|c| format!(":{c} - [0:0]")).collect();
        let (top, rest): (Vec<String>, Vec<String>) = {
            let (top, rest): (Vec<&Rule>, Vec<&Rule>) =
                self.rules.iter().partition(|r| r.top);
            (
                top.into_iter().map(|r| Self::render_rule(r, binary_name)).collect(),
                rest.into_iter().map(|r| Self::render_rule(r, binary_name)).collect(),
            )
        };
        let generated: HashSet<&str> =
            top.iter().chain(rest.iter()).map(String::as_str).collect();

        let is_ours = |line: &str| {
            let line = line.trim();
            if line.contains(binary_name) || generated.contains(line) {
                return true;
            }
            line.strip_prefix(':')
                .and_then(|decl| decl.split_whitespace().next())
                .is_some_and(|name| our_chains.contains(name))
        };
        let kept: Vec<&str> = saved.lines().filter(|l| !is_ours(l)).collect();

        let header = format!("*{table}");
        let Some(start) = kept.iter().position(|l| l.trim() == header) else {
            let mut out = vec![header];
            out.extend(decls);
            out.extend(top);
            out.extend(rest);
            out.push("COMMIT".to_string());
            return Ok(out.join("\n") + "\n");
        };

        let mut decl_end = start + 1;
        while decl_end < kept.len() && kept[decl_end].starts_with(':') {
            decl_end += 1;
        }
        let commit = kept[decl_end..]
            .iter()
            .position(|l| l.trim() == "COMMIT")
            .map(|p| p + decl_end)
            .ok_or_else(|| FirewallError::MalformedSave(table.to_string()))?;

        let owned = |lines: &[&str]| -> Vec<String> {
            lines.iter().map(|l| l.to_string()).collect()
        };
        let mut out = owned(&kept[..decl_end]);
        out.extend(decls);
        out.extend(top);
        out.extend(owned(&kept[decl_end..commit]));
        out.extend(rest);
        out.extend(owned(&kept[commit..]));
        Ok(out.join("\n") + "\n")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Both address families' filter tables plus the means to push them.
pub struct IptablesManager {
    binary_name: String,
    ipv4: IptablesTable,
    ipv6: IptablesTable,
    use_ipv6: bool,
    runner: Arc<dyn ProcessRunner>,
    log: Logger,
}

impl IptablesManager {
    pub fn new(
        binary_name: &str,
        use_ipv6: bool,
        runner: Arc<dyn ProcessRunner>,
        log: &Logger,
    ) -> Self {
        let mut tables = [IptablesTable::default(), IptablesTable::default()];
        for table in tables.iter_mut() {
            table.add_chain(FILTER_TOP, false);
            table.add_rule("FORWARD", &format!("-j {FILTER_TOP}"), false, true);
            table.add_rule("OUTPUT", &format!("-j {FILTER_TOP}"), false, true);
            table.add_chain("local", true);
            table.add_rule(FILTER_TOP, "-j $local", false, false);
            for builtin in ["INPUT", "OUTPUT", "FORWARD"] {
                table.add_chain(builtin, true);
                table.add_rule(builtin, &format!("-j ${builtin}"), false, false);
            }
        }
        let [ipv4, ipv6] = tables;
        Self {
            binary_name: binary_name.to_string(),
            ipv4,
            ipv6,
            use_ipv6,
            runner,
            log: log.new(slog::o!("component" => "iptables")),
        }
    }

    pub fn table(&self, family: Family) -> &IptablesTable {
        match family {
            Family::V4 => &self.ipv4,
            Family::V6 => &self.ipv6,
        }
    }

    pub fn table_mut(&mut self, family: Family) -> &mut IptablesTable {
        match family {
            Family::V4 => &mut self.ipv4,
            Family::V6 => &mut self.ipv6,
        }
    }

    /// Families currently being programmed.
    pub fn families(&self) -> &'static [Family] {
        if self.use_ipv6 {
            &[Family::V4, Family::V6]
        } else {
            &[Family::V4]
        }
    }

    /// Pushes the in-memory tables to the kernel with a save, merge and
    /// restore cycle per family.
    pub async fn apply(&self) -> Result<(), FirewallError> {
        for family in self.families() {
            let (cmd, table) = match family {
                Family::V4 => ("iptables", &self.ipv4),
                Family::V6 => ("ip6tables", &self.ipv6),
            };
            let saved = self
                .runner
                .run(Cmd::new(format!("{cmd}-save")).args(["-t", "filter"]).as_root())
                .await?;
            let merged = table.merge(&saved.stdout, "filter", &self.binary_name)?;
            self.runner
                .run(Cmd::new(format!("{cmd}-restore")).stdin(merged).as_root())
                .await?;
        }
        debug!(self.log, "applied firewall tables");
        Ok(())
    }
}

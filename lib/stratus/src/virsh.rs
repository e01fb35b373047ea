// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Hypervisor`] implemented by shelling out to `virsh`.

use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, Logger};
use tempfile::NamedTempFile;

use crate::exec::{Cmd, ExecError, ProcessRunner};
use crate::firewall::FilterObject;
use crate::hypervisor::{
    CpuInfo, CpuTopology, DomainDisk, Hypervisor, HypervisorError, MigrateFlags,
};
use crate::instance::PowerState;

const MIGRATE_OPTIONS: [(MigrateFlags, &str); 8] = [
    (MigrateFlags::LIVE, "--live"),
    (MigrateFlags::PEER2PEER, "--p2p"),
    (MigrateFlags::TUNNELLED, "--tunnelled"),
    (MigrateFlags::PERSIST_DEST, "--persistent"),
    (MigrateFlags::UNDEFINE_SOURCE, "--undefinesource"),
    (MigrateFlags::PAUSED, "--suspend"),
    (MigrateFlags::NON_SHARED_DISK, "--copy-storage-all"),
    (MigrateFlags::NON_SHARED_INC, "--copy-storage-inc"),
];

pub struct VirshHypervisor {
    uri: String,
    runner: Arc<dyn ProcessRunner>,
    log: Logger,
}

impl VirshHypervisor {
    pub fn new(uri: &str, runner: Arc<dyn ProcessRunner>, log: &Logger) -> Self {
        Self {
            uri: uri.to_string(),
            runner,
            log: log.new(slog::o!("component" => "virsh", "uri" => uri.to_string())),
        }
    }

    async fn virsh<I, S>(&self, subject: &str, args: I) -> Result<String, HypervisorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = Cmd::new("virsh").args(["-c", self.uri.as_str()]).args(args);
        debug!(self.log, "virsh"; "cmd" => %cmd);
        match self.runner.run(cmd).await {
            Ok(out) => Ok(out.stdout),
            Err(err) => Err(classify(err, subject)),
        }
    }

    /// Writes `document` to a temp file that lives as long as the handle.
    async fn staged(&self, document: &str) -> Result<NamedTempFile, HypervisorError> {
        let file = NamedTempFile::new()?;
        tokio::fs::write(file.path(), document).await?;
        Ok(file)
    }
}

/// Maps well-known virsh failures onto typed errors.
fn classify(err: ExecError, subject: &str) -> HypervisorError {
    if let ExecError::Failed { stderr, .. } = &err {
        if stderr.contains("Domain not found") || stderr.contains("failed to get domain") {
            return HypervisorError::DomainNotFound(subject.to_string());
        }
        if stderr.contains("Network filter not found")
            || stderr.contains("failed to get network filter")
        {
            return HypervisorError::FilterNotFound(subject.to_string());
        }
        if stderr.contains("already exists") {
            return HypervisorError::AlreadyExists(subject.to_string());
        }
    }
    HypervisorError::Exec(err)
}

fn parse_state(text: &str) -> PowerState {
    match text.trim() {
        "running" => PowerState::Running,
        "idle" | "blocked" => PowerState::Blocked,
        "paused" => PowerState::Paused,
        "in shutdown" => PowerState::Shutdown,
        "shut off" => PowerState::Shutoff,
        "crashed" => PowerState::Crashed,
        "pmsuspended" => PowerState::Suspended,
        _ => PowerState::NoState,
    }
}

/// Parses `domblklist --details` output.
fn parse_blklist(text: &str) -> Vec<DomainDisk> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [kind, _device, target, source @ ..] = fields.as_slice() else {
                return None;
            };
            let source = source.join(" ");
            Some(DomainDisk {
                kind: kind.to_string(),
                target: target.to_string(),
                source: (!source.is_empty() && source != "-").then_some(source),
                driver_type: None,
            })
        })
        .collect()
}

/// `(hypervisor type, version)` from `virsh version`, with the version
/// encoded as `major * 1_000_000 + minor * 1_000 + release`.
fn parse_version(text: &str) -> Option<(String, u64)> {
    let line = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("Running hypervisor:"))?;
    let mut parts = line.split_whitespace();
    let kind = parts.next()?.to_string();
    let mut numbers = parts.next()?.split('.').map(|n| n.parse::<u64>().ok());
    let major = numbers.next().flatten()?;
    let minor = numbers.next().flatten().unwrap_or(0);
    let release = numbers.next().flatten().unwrap_or(0);
    Some((kind, major * 1_000_000 + minor * 1_000 + release))
}

fn field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Builds [`CpuInfo`] from `virsh nodeinfo` and `/proc/cpuinfo`.
fn parse_cpu_info(nodeinfo: &str, cpuinfo: &str) -> CpuInfo {
    let number = |key| field(nodeinfo, key).and_then(|v| v.parse().ok()).unwrap_or(1);
    CpuInfo {
        arch: field(nodeinfo, "CPU model").unwrap_or_default().to_string(),
        model: field(cpuinfo, "model name").unwrap_or_default().to_string(),
        vendor: field(cpuinfo, "vendor_id").unwrap_or_default().to_string(),
        topology: CpuTopology {
            sockets: number("CPU socket(s)"),
            cores: number("Core(s) per socket"),
            threads: number("Thread(s) per core"),
        },
        features: field(cpuinfo, "flags")
            .map(|f| f.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define_domain(&self, descriptor: &str) -> Result<(), HypervisorError> {
        let file = self.staged(descriptor).await?;
        let path = file.path().display().to_string();
        self.virsh("domain", ["define".to_string(), path]).await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, ["start", name]).await?;
        Ok(())
    }

    async fn domain_state(
        &self,
        name: &str,
    ) -> Result<Option<PowerState>, HypervisorError> {
        match self.virsh(name, ["domstate", name]).await {
            Ok(out) => Ok(Some(parse_state(&out))),
            Err(HypervisorError::DomainNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn domain_descriptor(&self, name: &str) -> Result<String, HypervisorError> {
        self.virsh(name, ["dumpxml", name]).await
    }

    async fn domain_disks(&self, name: &str) -> Result<Vec<DomainDisk>, HypervisorError> {
        let out = self.virsh(name, ["domblklist", "--details", name]).await?;
        Ok(parse_blklist(&out))
    }

    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self.virsh("domains", ["list", "--all", "--name"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, ["destroy", name]).await?;
        Ok(())
    }

    async fn has_managed_save(&self, name: &str) -> Result<bool, HypervisorError> {
        let out = self.virsh(name, ["dominfo", name]).await?;
        Ok(field(&out, "Managed save") == Some("yes"))
    }

    async fn remove_managed_save(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, ["managedsave-remove", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, ["undefine", name]).await?;
        Ok(())
    }

    async fn attach_device(&self, name: &str, stanza: &str) -> Result<(), HypervisorError> {
        let file = self.staged(stanza).await?;
        let path = file.path().display().to_string();
        self.virsh(name, ["attach-device".to_string(), name.to_string(), path])
            .await?;
        Ok(())
    }

    async fn detach_disk(&self, name: &str, target: &str) -> Result<(), HypervisorError> {
        match self.virsh(name, ["detach-disk", name, target]).await {
            Err(HypervisorError::Exec(ExecError::Failed { stderr, .. }))
                if stderr.contains("No disk found") || stderr.contains("No device found") =>
            {
                Err(HypervisorError::DiskNotFound {
                    domain: name.to_string(),
                    disk: target.to_string(),
                })
            }
            other => other.map(|_| ()),
        }
    }

    async fn migrate_to_uri(
        &self,
        name: &str,
        uri: &str,
        flags: MigrateFlags,
        bandwidth: u64,
    ) -> Result<(), HypervisorError> {
        let mut args = vec!["migrate".to_string()];
        args.extend(
            MIGRATE_OPTIONS
                .iter()
                .filter(|(flag, _)| flags.contains(*flag))
                .map(|(_, opt)| opt.to_string()),
        );
        if bandwidth > 0 {
            args.extend(["--bandwidth".to_string(), bandwidth.to_string()]);
        }
        args.extend([name.to_string(), uri.to_string()]);
        self.virsh(name, args).await?;
        Ok(())
    }

    async fn define_filter(&self, filter: &FilterObject) -> Result<(), HypervisorError> {
        let file = self.staged(&filter.to_element().render()).await?;
        let path = file.path().display().to_string();
        self.virsh(&filter.name, ["nwfilter-define".to_string(), path]).await?;
        Ok(())
    }

    async fn undefine_filter(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, ["nwfilter-undefine", name]).await?;
        Ok(())
    }

    async fn filter_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        match self.virsh(name, ["nwfilter-dumpxml", name]).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::FilterNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn hypervisor_type(&self) -> Result<String, HypervisorError> {
        let out = self.virsh("version", ["version"]).await?;
        parse_version(&out).map(|(kind, _)| kind).ok_or(HypervisorError::Operation {
            op: "version",
            reason: "no running hypervisor reported".to_string(),
        })
    }

    async fn hypervisor_version(&self) -> Result<u64, HypervisorError> {
        let out = self.virsh("version", ["version"]).await?;
        parse_version(&out).map(|(_, v)| v).ok_or(HypervisorError::Operation {
            op: "version",
            reason: "no running hypervisor reported".to_string(),
        })
    }

    async fn cpu_info(&self) -> Result<CpuInfo, HypervisorError> {
        let nodeinfo = self.virsh("node", ["nodeinfo"]).await?;
        let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo").await?;
        Ok(parse_cpu_info(&nodeinfo, &cpuinfo))
    }

    async fn vcpus_used(&self) -> Result<u32, HypervisorError> {
        let running = self.virsh("domains", ["list", "--name"]).await?;
        let mut total = 0;
        for name in running.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let out = self.virsh(name, ["vcpucount", name, "--live", "--active"]).await?;
            total += out.trim().parse::<u32>().unwrap_or(0);
        }
        Ok(total)
    }
}

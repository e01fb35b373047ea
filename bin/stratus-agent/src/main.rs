// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use slog::{info, Logger};

use stratus::firewall::{ProviderRule, SecurityGroupRule, SecurityGroupStore, StoreError};
use stratus::images::LocalImageService;
use stratus::{
    connection_uri, BlockDeviceInfo, HostRunner, HypervisorConnection, Instance,
    NetworkInfo, VirshHypervisor,
};

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Compute-node agent driving a local hypervisor
struct Args {
    /// TOML configuration file; built-in defaults apply when omitted
    #[clap(long, action)]
    config: Option<PathBuf>,

    /// Logging level for the agent
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prints the hypervisor connection URI.
    Uri,

    /// Renders the domain descriptor for an instance.
    RenderDomain {
        /// JSON file holding the instance record
        #[clap(long, action)]
        instance: PathBuf,

        /// JSON file holding the instance's network info
        #[clap(long, action)]
        network: Option<PathBuf>,

        /// JSON file holding the instance's block device info
        #[clap(long, action)]
        block_devices: Option<PathBuf>,

        #[clap(long, action)]
        rescue: bool,
    },

    /// Samples host capacity and prints it as JSON.
    HostStats {
        /// Keep sampling every this many seconds
        #[clap(long, action)]
        interval: Option<u64>,
    },

    /// Prints the disk report for a defined domain.
    DiskInfo {
        #[clap(action)]
        name: String,
    },
}

/// Security-group store for an agent that is not attached to a control
/// plane: no groups, no provider rules.
struct Unmanaged;

#[async_trait]
impl SecurityGroupStore for Unmanaged {
    async fn security_groups_for_instance(
        &self,
        _instance_id: u64,
    ) -> Result<Vec<u64>, StoreError> {
        Ok(Vec::new())
    }

    async fn rules_for_group(
        &self,
        _group_id: u64,
    ) -> Result<Vec<SecurityGroupRule>, StoreError> {
        Ok(Vec::new())
    }

    async fn group_members(&self, _group_id: u64) -> Result<Vec<u64>, StoreError> {
        Ok(Vec::new())
    }

    async fn fixed_addresses(
        &self,
        _instance_id: u64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn provider_rules(&self) -> Result<Vec<ProviderRule>, StoreError> {
        Ok(Vec::new())
    }
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("stratus-agent", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), slog::o!())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn connect(
    config: stratus_config::Config,
    log: &Logger,
) -> anyhow::Result<HypervisorConnection> {
    let runner = Arc::new(HostRunner::new(&config.exec.root_helper, log));
    let hypervisor = Arc::new(VirshHypervisor::new(
        &connection_uri(&config.hypervisor),
        runner.clone(),
        log,
    ));
    let images = Arc::new(LocalImageService::new(
        config.hypervisor.instances_path.join("_images"),
    ));
    HypervisorConnection::new(
        config,
        hypervisor,
        runner,
        images,
        Arc::new(Unmanaged),
        log,
    )
    .context("failed to set up hypervisor connection")
}

async fn run(
    command: Command,
    config: stratus_config::Config,
    log: Logger,
) -> anyhow::Result<()> {
    match command {
        Command::Uri => {
            println!("{}", connection_uri(&config.hypervisor));
        }
        Command::RenderDomain { instance, network, block_devices, rescue } => {
            let instance: Instance = read_json(&instance)?;
            let network_info: NetworkInfo = match network {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let block_device_info: Option<BlockDeviceInfo> =
                block_devices.as_deref().map(read_json::<BlockDeviceInfo>).transpose()?;
            let conn = connect(config, &log)?;
            let xml = conn
                .to_xml(&instance, &network_info, rescue, block_device_info.as_ref())
                .with_context(|| format!("failed to render {}", instance.name))?;
            print!("{xml}");
        }
        Command::HostStats { interval } => {
            let conn = connect(config, &log)?;
            loop {
                let stats = conn
                    .get_host_stats(true)
                    .await
                    .context("failed to sample host")?;
                println!("{}", serde_json::to_string(&stats)?);
                let Some(secs) = interval else {
                    break;
                };
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
        }
        Command::DiskInfo { name } => {
            let conn = connect(config, &log)?;
            let report = conn
                .get_instance_disk_info(&name)
                .await
                .with_context(|| format!("failed to inspect disks of {name}"))?;
            println!("{report}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let Args { config, log_level, command } = Args::parse();
    let log = build_logger(log_level);

    let config = match &config {
        Some(path) => stratus_config::parse(path).with_context(|| {
            format!("failed to load config from {}", path.display())
        })?,
        None => stratus_config::Config::default(),
    };
    info!(log, "starting stratus-agent";
        "type" => %config.hypervisor.virt_type,
        "uri" => connection_uri(&config.hypervisor));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stratus-agent")
        .enable_all()
        .build()?;
    runtime.block_on(run(command, config, log))
}

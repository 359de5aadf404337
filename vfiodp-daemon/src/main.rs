use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vfiodp_core::{init_observability, Config, NotifyWatcherFactory, ResourceConfig};

mod monitor;
mod orchestrator;
mod plugin;
mod proto_convert;
mod registration;
mod shutdown;

#[cfg(test)]
mod testing;

/// Kubelet device plugin advertising VFIO-bound PCI devices.
#[derive(Debug, Parser)]
#[command(name = "vfiodpd", version, about)]
struct Args {
    /// JSON configuration file; missing file means defaults
    #[arg(long, env = "VFIODP_CONFIG", default_value = "/etc/vfiodp/config.json")]
    config: PathBuf,

    /// Resource to advertise, repeatable (e.g. 8086:0bda=intel.com/gaudi)
    #[arg(long = "resource", value_name = "SELECTOR=RESOURCE")]
    resources: Vec<String>,

    /// Where the host root filesystem is visible
    #[arg(long)]
    host_root: Option<PathBuf>,
}

impl Args {
    /// Overlay command line values on the loaded configuration.
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        for pair in &self.resources {
            config.resources.push(ResourceConfig::parse_pair(pair)?);
        }
        if let Some(host_root) = &self.host_root {
            config.paths.host_root = host_root.clone();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config)?;
    config.validate().context("invalid configuration")?;

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        resources = config.resources.len(),
        host_root = %config.paths.host_root.display(),
        plugin_dir = %config.paths.plugin_dir.display(),
        "vfiodpd starting"
    );

    let stop = shutdown::stop_signal().context("installing signal handlers")?;
    let orchestrator = orchestrator::Orchestrator::new(config, Arc::new(NotifyWatcherFactory));
    orchestrator.run(stop).await?;

    info!("vfiodpd shutting down");
    Ok(())
}

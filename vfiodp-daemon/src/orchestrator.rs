//! Runs one device plugin per configured resource.
//!
//! Each resource gets its own task: discover once, build the plugin, then
//! serve in a loop. Failed sessions climb the backoff ladder; successful ones
//! reset it. After a kubelet restart the next session keeps retrying
//! registration until the kubelet is back.

use crate::plugin::{PciDevicePlugin, PluginSettings, ServeExit};
use crate::registration::RegistrationPolicy;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vfiodp_core::discovery::discover_with_retry;
use vfiodp_core::observability::metrics;
use vfiodp_core::{Config, PciScanner, Result, WatcherFactory};

pub struct Orchestrator {
    config: Config,
    watchers: Arc<dyn WatcherFactory>,
}

impl Orchestrator {
    pub fn new(config: Config, watchers: Arc<dyn WatcherFactory>) -> Self {
        Self { config, watchers }
    }

    /// Serve every resource until `stop` fires.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<()> {
        let scanner = PciScanner::new(
            self.config.paths.pci_devices(),
            self.config.passthrough_driver.clone(),
        );
        if let Err(e) = scanner.ensure_available() {
            warn!(error = %e, "PCI device directory not readable, discovery will keep retrying");
        }

        let mut tasks = JoinSet::new();
        for resource in &self.config.resources {
            let settings = PluginSettings::from_config(&self.config, resource)?;
            tasks.spawn(serve_resource(settings, self.watchers.clone(), stop.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Resource task failed");
            }
        }
        info!("All device plugins stopped");
        Ok(())
    }
}

/// Discover, then start the plugin over and over until stopped.
pub async fn serve_resource(
    settings: PluginSettings,
    watchers: Arc<dyn WatcherFactory>,
    mut stop: watch::Receiver<bool>,
) {
    let resource = settings.resource_name.clone();
    let ladder = settings.backoff.clone();
    let scanner = PciScanner::new(settings.paths.pci_devices(), settings.passthrough_driver.clone());

    info!(resource = %resource, selector = %settings.selector, "Discovering devices");
    let Some(devices) = discover_with_retry(&scanner, &settings.selector, &ladder, &mut stop).await
    else {
        info!(resource = %resource, "Stopped before any device was found");
        return;
    };
    info!(resource = %resource, count = devices.len(), "Discovered devices");

    let plugin = Arc::new(PciDevicePlugin::new(settings, watchers, &devices));
    let mut attempt = 0;
    let mut policy = RegistrationPolicy::Bounded;

    loop {
        if *stop.borrow() {
            break;
        }

        match plugin.start(policy, stop.clone()).await {
            Ok(exit) => {
                attempt = 0;
                policy = match exit {
                    ServeExit::NodeAgentRestarted => RegistrationPolicy::UntilRegistered,
                    _ => RegistrationPolicy::Bounded,
                };
                if exit != ServeExit::Stopped {
                    metrics::record_plugin_restart(&resource, exit.as_str());
                }
            }
            Err(e) => {
                attempt = ladder.next_attempt(attempt);
                policy = RegistrationPolicy::Bounded;
                metrics::record_plugin_restart(&resource, "error");
                error!(
                    resource = %resource,
                    error = %e,
                    retry_in = ?ladder.delay(attempt),
                    "Device plugin failed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(ladder.delay(attempt)) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    plugin.stop_serving(true).await;
    info!(resource = %resource, "Device plugin stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeKubelet};
    use std::time::Duration;
    use tempfile::TempDir;
    use vfiodp_core::discovery::testing::FakePciTree;
    use vfiodp_core::{FakeWatcherFactory, ResourceConfig, WatchEventKind};

    fn config(tree: &FakePciTree, plugin_dir: &std::path::Path) -> Config {
        let mut config = Config {
            backoff_ms: vec![20, 50],
            registration_retry_ms: 20,
            connection_timeout_ms: 1_000,
            resources: vec![ResourceConfig::new("8086:0bda", "intel.com/gaudi")],
            ..Config::default()
        };
        config.paths.host_root = tree.root().to_path_buf();
        config.paths.plugin_dir = plugin_dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_orchestrator_registers_and_stops() {
        let tree = FakePciTree::new();
        tree.add_device("0000:3d:00.0", "8086:0bda", Some("vfio-pci"), Some("12"), Some("0"));
        tree.add_vfio_node("12");
        let plugin_dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::start(&plugin_dir.path().join("kubelet.sock")).await;

        let config = config(&tree, plugin_dir.path());
        let socket = config.paths.plugin_socket_path("pci", "intel.com/gaudi");
        let orchestrator = Orchestrator::new(config, Arc::new(FakeWatcherFactory::new()));
        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(async move { orchestrator.run(stop).await });

        assert!(kubelet.wait_for_registrations(1, Duration::from_secs(5)).await);
        assert!(eventually(Duration::from_secs(2), || socket.exists()).await);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_orchestrator_reregisters_after_kubelet_restart() {
        let tree = FakePciTree::new();
        tree.add_device("0000:3d:00.0", "8086:0bda", Some("vfio-pci"), Some("12"), Some("0"));
        tree.add_vfio_node("12");
        let plugin_dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::start(&plugin_dir.path().join("kubelet.sock")).await;
        let watchers = FakeWatcherFactory::new();

        let config = config(&tree, plugin_dir.path());
        let socket = config.paths.plugin_socket_path("pci", "intel.com/gaudi");
        let orchestrator = Orchestrator::new(config, Arc::new(watchers.clone()));
        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(async move { orchestrator.run(stop).await });

        assert!(kubelet.wait_for_registrations(1, Duration::from_secs(5)).await);
        assert!(watchers.wait_for_watch(plugin_dir.path(), Duration::from_secs(2)).await);

        // The kubelet wipes the plugin directory when it restarts
        std::fs::remove_file(&socket).unwrap();
        assert_eq!(watchers.emit(&socket, WatchEventKind::Remove), 1);

        assert!(kubelet.wait_for_registrations(2, Duration::from_secs(5)).await);
        let requests = kubelet.requests();
        assert_eq!(requests[1].resource_name, "intel.com/gaudi");
        assert_eq!(requests[1].endpoint, requests[0].endpoint);
        assert!(eventually(Duration::from_secs(2), || socket.exists()).await);
        assert!(eventually(Duration::from_secs(2), || watchers.created() == 2).await);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_orchestrator_waits_for_devices() {
        let tree = FakePciTree::new();
        let plugin_dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::start(&plugin_dir.path().join("kubelet.sock")).await;

        let orchestrator =
            Orchestrator::new(config(&tree, plugin_dir.path()), Arc::new(FakeWatcherFactory::new()));
        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(async move { orchestrator.run(stop).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(kubelet.requests().is_empty());

        // Devices appear later; the retry ladder picks them up
        tree.add_device("0000:3d:00.0", "8086:0bda", Some("vfio-pci"), Some("12"), Some("0"));
        tree.add_vfio_node("12");
        assert!(kubelet.wait_for_registrations(1, Duration::from_secs(5)).await);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_is_retried() {
        let tree = FakePciTree::new();
        tree.add_device("0000:3d:00.0", "8086:0bda", Some("vfio-pci"), Some("12"), Some("0"));
        tree.add_vfio_node("12");
        let plugin_dir = TempDir::new().unwrap();
        let watchers = FakeWatcherFactory::new();

        let orchestrator =
            Orchestrator::new(config(&tree, plugin_dir.path()), Arc::new(watchers.clone()));
        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(async move { orchestrator.run(stop).await });

        // No kubelet yet: Start() fails and is retried on the ladder
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(watchers.created(), 0);

        let kubelet = FakeKubelet::start(&plugin_dir.path().join("kubelet.sock")).await;
        assert!(kubelet.wait_for_registrations(1, Duration::from_secs(5)).await);
        assert!(eventually(Duration::from_secs(2), || watchers.created() == 1).await);

        // Unrelated events are ignored
        watchers.emit(plugin_dir.path().join("other.sock"), WatchEventKind::Remove);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    }
}

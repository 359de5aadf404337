//! Filesystem-driven device health and kubelet restart detection.
//!
//! One monitor runs per serving session. It watches the VFIO node directory,
//! each advertised device node and the directory holding the plugin socket:
//!
//! - node created → device Healthy
//! - node removed or renamed → device Unhealthy
//! - plugin socket removed while running → the kubelet restarted; stop the
//!   session, rediscover and report [`MonitorExit::NodeAgentRestarted`]

use crate::plugin::{PciDevicePlugin, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vfiodp_core::discovery::discover_with_retry;
use vfiodp_core::{
    DeviceHealth, DevicePluginError, PathWatcher, Result, WatchEvent, WatchEventKind,
};

/// Why the monitor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stop signal fired or the session ended
    Stopped,
    /// Plugin socket vanished; the registry now holds a fresh discovery
    NodeAgentRestarted,
}

pub struct HealthMonitor {
    plugin: Arc<PciDevicePlugin>,
    session: Arc<Session>,
    watcher: Box<dyn PathWatcher>,
    node_dir: PathBuf,
    socket_path: PathBuf,
    stop: watch::Receiver<bool>,
}

impl HealthMonitor {
    /// Create the watcher and register every watch.
    ///
    /// Fails when the watcher cannot be created, a directory cannot be
    /// watched, or the plugin socket is missing. A missing device node only
    /// marks that device Unhealthy.
    pub async fn setup(
        plugin: Arc<PciDevicePlugin>,
        session: Arc<Session>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let node_dir = plugin.settings().paths.vfio_nodes();
        let socket_path = plugin.socket_path().to_path_buf();

        let mut watcher = plugin.watchers().create()?;
        watcher.watch(&node_dir)?;

        for id in plugin.device_ids().await {
            let node = node_dir.join(&id);
            if node.exists() {
                watcher.watch(&node)?;
            } else {
                warn!(
                    resource = %plugin.resource_name(),
                    device = %id,
                    node = %node.display(),
                    "Device node missing, marking unhealthy"
                );
                plugin.update_health(&id, DeviceHealth::Unhealthy).await;
            }
        }

        let socket_dir = socket_path.parent().ok_or_else(|| DevicePluginError::InvalidConfig {
            reason: format!("plugin socket {} has no parent directory", socket_path.display()),
        })?;
        watcher.watch(socket_dir)?;

        if !socket_path.exists() {
            return Err(DevicePluginError::WatchPathFailed {
                path: socket_path,
                reason: "plugin socket does not exist".to_string(),
            });
        }

        debug!(resource = %plugin.resource_name(), node_dir = %node_dir.display(), "Health monitor ready");
        Ok(Self { plugin, session, watcher, node_dir, socket_path, stop })
    }

    pub async fn run(mut self) -> Result<MonitorExit> {
        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return Ok(MonitorExit::Stopped);
                    }
                }
                _ = self.session.finished() => return Ok(MonitorExit::Stopped),
                event = self.watcher.next_event() => {
                    let event = event.ok_or_else(|| DevicePluginError::WatcherFailed {
                        reason: "watcher event stream closed".to_string(),
                    })?;
                    if let Some(exit) = self.handle_event(event).await {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Option<MonitorExit> {
        if event.path == self.socket_path {
            return match event.kind {
                WatchEventKind::Remove => Some(self.node_agent_restarted().await),
                _ => None,
            };
        }

        if event.path.parent() != Some(self.node_dir.as_path()) {
            return None;
        }
        let id = event.path.file_name()?.to_str()?;
        let health = match event.kind {
            WatchEventKind::Create => DeviceHealth::Healthy,
            WatchEventKind::Remove | WatchEventKind::Rename => DeviceHealth::Unhealthy,
            WatchEventKind::Other => return None,
        };

        self.plugin.update_health(id, health).await;
        None
    }

    async fn node_agent_restarted(&mut self) -> MonitorExit {
        if !self.session.is_running() {
            return MonitorExit::Stopped;
        }

        let settings = self.plugin.settings();
        warn!(resource = %settings.resource_name, "Plugin socket removed, kubelet restarted");
        self.plugin.stop_serving(false).await;

        let discovered = discover_with_retry(
            self.plugin.scanner(),
            &settings.selector,
            &settings.backoff,
            &mut self.stop,
        )
        .await;

        match discovered {
            Some(devices) => {
                self.plugin.replace_devices(&devices).await;
                info!(resource = %settings.resource_name, "Rediscovered devices after kubelet restart");
                MonitorExit::NodeAgentRestarted
            }
            None => MonitorExit::Stopped,
        }
    }
}

//! Configuration management.

use crate::backoff::{BackoffLadder, DEFAULT_LADDER_MS};
use crate::discovery::{PciSelector, VFIO_PCI_DRIVER};
use crate::error::{DevicePluginError, Result};
use crate::paths::HostPaths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default socket name prefix inside the plugin directory.
pub const DEFAULT_SOCKET_PREFIX: &str = "pci";

/// One advertised resource: devices matching `selector` exposed as `resource_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// `vendor:device` id (e.g., "8086:0bda")
    pub selector: String,
    /// Extended resource name (e.g., "intel.com/gaudi")
    pub resource_name: String,
}

impl ResourceConfig {
    pub fn new(selector: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self { selector: selector.into(), resource_name: resource_name.into() }
    }

    /// Parse the `SELECTOR=RESOURCE` command line form.
    pub fn parse_pair(pair: &str) -> Result<Self> {
        let (selector, resource_name) =
            pair.split_once('=').ok_or_else(|| DevicePluginError::InvalidConfig {
                reason: format!("expected SELECTOR=RESOURCE, got '{}'", pair),
            })?;
        Ok(Self::new(selector.trim(), resource_name.trim()))
    }

    pub fn parsed_selector(&self) -> Result<PciSelector> {
        PciSelector::parse(&self.selector)
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Port for the Prometheus exporter; disabled when unset
    pub metrics_port: Option<u16>,
    pub socket_prefix: String,
    pub passthrough_driver: String,
    pub paths: HostPaths,
    /// Retry ladder for discovery and plugin restarts
    pub backoff_ms: Vec<u64>,
    /// Interval between registration attempts after a kubelet restart
    pub registration_retry_ms: u64,
    /// Bound on connecting to a socket and on one registration call
    pub connection_timeout_ms: u64,
    pub resources: Vec<ResourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            passthrough_driver: VFIO_PCI_DRIVER.to_string(),
            paths: HostPaths::default(),
            backoff_ms: DEFAULT_LADDER_MS.to_vec(),
            registration_retry_ms: 2_000,
            connection_timeout_ms: 5_000,
            resources: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| DevicePluginError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| DevicePluginError::InvalidConfig {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Check selectors, resource names and timing values.
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(DevicePluginError::InvalidConfig {
                reason: "no resources configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            resource.parsed_selector()?;

            let name = resource.resource_name.as_str();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(DevicePluginError::InvalidConfig {
                    reason: format!("invalid resource name '{}'", name),
                });
            }
            if !seen.insert(name) {
                return Err(DevicePluginError::InvalidConfig {
                    reason: format!("resource '{}' configured twice", name),
                });
            }
        }

        if self.socket_prefix.is_empty() || self.socket_prefix.contains('/') {
            return Err(DevicePluginError::InvalidConfig {
                reason: format!("invalid socket prefix '{}'", self.socket_prefix),
            });
        }
        if self.connection_timeout_ms == 0 || self.registration_retry_ms == 0 {
            return Err(DevicePluginError::InvalidConfig {
                reason: "timeouts and retry intervals must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffLadder {
        BackoffLadder::from_millis(&self.backoff_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }
}

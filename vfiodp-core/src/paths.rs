//! Centralized host path configuration.
//!
//! The daemon normally runs inside a privileged pod and reaches the host
//! through `/proc/1/root`, so every sysfs and `/dev` path goes through
//! [`HostPaths::host_path`]. The device plugin directory is bind-mounted from
//! the host and is used as-is.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Default prefix under which the host filesystem is visible.
pub const DEFAULT_HOST_ROOT: &str = "/proc/1/root";

/// Default kubelet device plugin directory.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

/// Default name of the kubelet registration socket inside the plugin directory.
pub const DEFAULT_KUBELET_SOCKET: &str = "kubelet.sock";

/// Sysfs directory listing PCI devices.
pub const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";

/// Directory holding the VFIO group device nodes.
pub const VFIO_DEV_DIR: &str = "/dev/vfio";

/// Name of the shared VFIO container node inside [`VFIO_DEV_DIR`].
pub const VFIO_CONTROL_NODE: &str = "vfio";

/// Host filesystem layout used by discovery, reset, health monitoring and
/// registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    /// Prefix under which the host root filesystem is visible.
    pub host_root: PathBuf,
    /// PCI device directory, relative to the host root.
    pub pci_devices_dir: PathBuf,
    /// VFIO device node directory, relative to the host root. This is also the
    /// path handed to the kubelet in device specs.
    pub vfio_dev_dir: PathBuf,
    /// Kubelet device plugin directory (not prefixed by `host_root`).
    pub plugin_dir: PathBuf,
    /// Kubelet registration socket name inside `plugin_dir`.
    pub kubelet_socket: String,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from(DEFAULT_HOST_ROOT),
            pci_devices_dir: PathBuf::from(PCI_DEVICES_DIR),
            vfio_dev_dir: PathBuf::from(VFIO_DEV_DIR),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            kubelet_socket: DEFAULT_KUBELET_SOCKET.to_string(),
        }
    }
}

impl HostPaths {
    /// Resolve an absolute host path below `host_root`.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        let relative: PathBuf = path
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        self.host_root.join(relative)
    }

    /// PCI device directory as seen from this process.
    pub fn pci_devices(&self) -> PathBuf {
        self.host_path(&self.pci_devices_dir)
    }

    /// VFIO device node directory as seen from this process (watched for health).
    pub fn vfio_nodes(&self) -> PathBuf {
        self.host_path(&self.vfio_dev_dir)
    }

    /// Path of the kubelet registration socket.
    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.kubelet_socket)
    }

    /// Path of the plugin socket serving `resource_name`.
    ///
    /// Slashes in the resource name become dashes, so `intel.com/gaudi` with
    /// prefix `pci` maps to `{plugin_dir}/pci-intel.com-gaudi.sock`.
    pub fn plugin_socket_path(&self, prefix: &str, resource_name: &str) -> PathBuf {
        self.plugin_dir.join(format!("{}-{}.sock", prefix, resource_name.replace('/', "-")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_path_prefixing() {
        let paths = HostPaths { host_root: PathBuf::from("/proc/1/root"), ..Default::default() };
        assert_eq!(paths.pci_devices(), PathBuf::from("/proc/1/root/sys/bus/pci/devices"));
        assert_eq!(paths.vfio_nodes(), PathBuf::from("/proc/1/root/dev/vfio"));

        let on_host = HostPaths { host_root: PathBuf::from("/"), ..Default::default() };
        assert_eq!(on_host.vfio_nodes(), PathBuf::from("/dev/vfio"));
    }

    #[test]
    fn test_plugin_socket_path() {
        let paths = HostPaths::default();
        assert_eq!(
            paths.plugin_socket_path("pci", "intel.com/gaudi"),
            PathBuf::from("/var/lib/kubelet/device-plugins/pci-intel.com-gaudi.sock")
        );
        assert_eq!(
            paths.kubelet_socket_path(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }
}

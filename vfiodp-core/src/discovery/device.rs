//! PCI device records and the sysfs attributes they are built from.

use crate::error::{DevicePluginError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Kernel driver that hands devices to userspace for passthrough.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// Sysfs attribute names read or written per device.
pub mod attr {
    pub const UEVENT: &str = "uevent";
    pub const DRIVER: &str = "driver";
    pub const IOMMU_GROUP: &str = "iommu_group";
    pub const NUMA_NODE: &str = "numa_node";
    pub const RESET: &str = "reset";
}

/// Immutable discovery record for one PCI function bound to the passthrough driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// Lowercase `vendor:device` id (e.g., "8086:0bda")
    pub pci_id: String,
    /// Bound driver (always the passthrough driver for discovered devices)
    pub driver: String,
    /// PCI address (e.g., "0000:3d:00.0")
    pub pci_address: String,
    /// IOMMU group ID, also the id advertised to the kubelet
    pub iommu_group: String,
    /// NUMA node (-1 if unknown)
    pub numa_node: i32,
}

impl PciDevice {
    /// NUMA node as a topology hint, if the kernel reported one.
    pub fn numa_hint(&self) -> Option<i64> {
        (self.numa_node >= 0).then_some(i64::from(self.numa_node))
    }
}

/// Extract the `PCI_ID` value from a device `uevent` attribute.
pub fn parse_uevent_pci_id(uevent: &str) -> Option<String> {
    uevent
        .lines()
        .filter_map(|line| line.trim().strip_prefix("PCI_ID="))
        .map(|id| id.trim().to_ascii_lowercase())
        .find(|id| !id.is_empty())
}

/// Read the lowercase `vendor:device` id of a device.
pub fn read_pci_id(device_path: &Path) -> Result<String> {
    let uevent_path = device_path.join(attr::UEVENT);
    let content = fs::read_to_string(&uevent_path)
        .map_err(|e| DevicePluginError::io(uevent_path.clone(), e))?;

    parse_uevent_pci_id(&content).ok_or_else(|| DevicePluginError::InvalidAttribute {
        path: uevent_path.clone(),
        reason: "no PCI_ID".to_string(),
    })
}

/// Read the basename of a sysfs symlink attribute (`driver`, `iommu_group`).
pub fn read_link_name(device_path: &Path, attribute: &str) -> Result<String> {
    let link = device_path.join(attribute);
    let target = fs::read_link(&link).map_err(|e| DevicePluginError::io(link.clone(), e))?;

    target.file_name().map(|n| n.to_string_lossy().to_string()).ok_or_else(|| {
        DevicePluginError::InvalidAttribute {
            reason: format!("link target {} has no basename", target.display()),
            path: link.clone(),
        }
    })
}

/// Read the NUMA node for a device, -1 when unknown or unreadable.
pub fn read_numa_node(device_path: &Path) -> i32 {
    fs::read_to_string(device_path.join(attr::NUMA_NODE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(-1)
}

/// Writes function level resets into the host PCI device tree.
#[derive(Debug, Clone)]
pub struct DeviceResetter {
    pci_devices_path: PathBuf,
}

impl DeviceResetter {
    pub fn new(pci_devices_path: impl Into<PathBuf>) -> Self {
        Self { pci_devices_path: pci_devices_path.into() }
    }

    /// Perform a function level reset by writing "1" to the device's `reset`
    /// attribute. The attribute is never created. Sysfs ignores the offset,
    /// so appending behaves like a plain write there.
    pub fn reset(&self, pci_address: &str) -> Result<()> {
        let reset_path = self.pci_devices_path.join(pci_address).join(attr::RESET);
        debug!(address = %pci_address, path = %reset_path.display(), "Resetting PCI device");

        let failed =
            |source| DevicePluginError::ResetFailed { pci_address: pci_address.to_string(), source };

        let mut file = fs::OpenOptions::new().append(true).open(&reset_path).map_err(failed)?;
        file.write_all(b"1").map_err(failed)?;
        file.flush().map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_uevent() {
        let uevent = "DRIVER=vfio-pci\nPCI_CLASS=120000\nPCI_ID=8086:0BDA\nPCI_SLOT_NAME=0000:3d:00.0\n";
        assert_eq!(parse_uevent_pci_id(uevent), Some("8086:0bda".to_string()));
        assert_eq!(parse_uevent_pci_id("DRIVER=vfio-pci\n"), None);
        assert_eq!(parse_uevent_pci_id("PCI_ID=\n"), None);
    }

    #[test]
    fn test_numa_node_defaults_to_unknown() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_numa_node(dir.path()), -1);

        fs::write(dir.path().join(attr::NUMA_NODE), "garbage").unwrap();
        assert_eq!(read_numa_node(dir.path()), -1);

        fs::write(dir.path().join(attr::NUMA_NODE), "1\n").unwrap();
        assert_eq!(read_numa_node(dir.path()), 1);
    }

    #[test]
    fn test_reset_writes_one() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("0000:3d:00.0");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join(attr::RESET), "").unwrap();

        let resetter = DeviceResetter::new(dir.path());
        resetter.reset("0000:3d:00.0").unwrap();
        assert_eq!(fs::read_to_string(device.join(attr::RESET)).unwrap(), "1");

        resetter.reset("0000:3d:00.0").unwrap();
        assert_eq!(fs::read_to_string(device.join(attr::RESET)).unwrap(), "11");
    }

    #[test]
    fn test_missing_pci_id_is_attribute_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(attr::UEVENT), "DRIVER=vfio-pci\n").unwrap();

        let err = read_pci_id(dir.path()).unwrap_err();
        assert!(matches!(err, DevicePluginError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_reset_does_not_create_attribute() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("0000:3d:00.0")).unwrap();

        let err = DeviceResetter::new(dir.path()).reset("0000:3d:00.0").unwrap_err();
        assert!(matches!(err, DevicePluginError::ResetFailed { .. }));
        assert!(!dir.path().join("0000:3d:00.0").join(attr::RESET).exists());
    }
}

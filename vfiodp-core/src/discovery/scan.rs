//! Scans the host PCI device tree for passthrough-ready accelerators.

use crate::backoff::BackoffLadder;
use crate::discovery::device::{attr, read_link_name, read_numa_node, read_pci_id, PciDevice};
use crate::discovery::selector::PciSelector;
use crate::error::{DevicePluginError, Result};
use crate::observability::metrics;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reasons a PCI entry is left out of a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `uevent` could not be read or had no `PCI_ID`
    Uevent,
    /// Bound to another driver, or the `driver` link is unreadable
    Driver,
    /// No resolvable IOMMU group; the device cannot be isolated
    IommuGroup,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Uevent => "uevent",
            SkipReason::Driver => "driver",
            SkipReason::IommuGroup => "iommu_group",
        }
    }
}

/// Discovers devices matching a selector below a PCI device directory.
#[derive(Debug, Clone)]
pub struct PciScanner {
    pci_devices_path: PathBuf,
    driver: String,
}

impl PciScanner {
    pub fn new(pci_devices_path: impl Into<PathBuf>, driver: impl Into<String>) -> Self {
        Self { pci_devices_path: pci_devices_path.into(), driver: driver.into() }
    }

    pub fn pci_devices_path(&self) -> &Path {
        &self.pci_devices_path
    }

    /// Enumerate every device entry and keep those matching `selector` that
    /// are bound to the passthrough driver and have an IOMMU group.
    ///
    /// Per-device failures are logged and skipped. An unreadable device
    /// directory yields an empty list; no devices is not an error.
    pub fn scan(&self, selector: &PciSelector) -> Vec<PciDevice> {
        let entries = match fs::read_dir(&self.pci_devices_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    path = %self.pci_devices_path.display(),
                    error = %e,
                    "Failed to read PCI device directory"
                );
                return Vec::new();
            }
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read PCI device entry");
                    continue;
                }
            };
            let address = entry.file_name().to_string_lossy().to_string();

            match self.inspect(&entry.path(), &address, selector) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(reason) => metrics::record_discovery_skip(reason.as_str()),
            }
        }

        devices.sort_by(|a, b| a.pci_address.cmp(&b.pci_address));
        devices
    }

    /// Build a record for one entry. `Ok(None)` means the device is simply not
    /// ours; `Err` means it matched but could not be used.
    fn inspect(
        &self,
        device_path: &Path,
        address: &str,
        selector: &PciSelector,
    ) -> std::result::Result<Option<PciDevice>, SkipReason> {
        let pci_id = match read_pci_id(device_path) {
            Ok(id) => id,
            Err(e) => {
                debug!(address = %address, error = %e, "Failed to read PCI id");
                return Err(SkipReason::Uevent);
            }
        };
        if !selector.matches(&pci_id) {
            return Ok(None);
        }

        let driver = match read_link_name(device_path, attr::DRIVER) {
            Ok(driver) if driver == self.driver => driver,
            Ok(driver) => {
                debug!(address = %address, driver = %driver, "Matching device bound to another driver");
                return Err(SkipReason::Driver);
            }
            Err(e) => {
                debug!(address = %address, error = %e, "Matching device has no driver");
                return Err(SkipReason::Driver);
            }
        };

        let iommu_group = match read_link_name(device_path, attr::IOMMU_GROUP) {
            Ok(group) => group,
            Err(e) => {
                warn!(address = %address, error = %e, "Matching device has no IOMMU group, skipping");
                return Err(SkipReason::IommuGroup);
            }
        };

        let numa_node = read_numa_node(device_path);

        debug!(
            address = %address,
            pci_id = %pci_id,
            iommu_group = %iommu_group,
            numa_node = %numa_node,
            "Discovered PCI device"
        );

        Ok(Some(PciDevice {
            pci_id,
            driver,
            pci_address: address.to_string(),
            iommu_group,
            numa_node,
        }))
    }

    /// Fail unless the PCI device directory exists; used for config sanity checks.
    pub fn ensure_available(&self) -> Result<()> {
        fs::metadata(&self.pci_devices_path)
            .map(|_| ())
            .map_err(|e| DevicePluginError::io(self.pci_devices_path.clone(), e))
    }
}

/// Scan repeatedly on the backoff ladder until at least one device is found.
///
/// Returns `None` as soon as `stop` fires (or its sender goes away), without
/// any partial result.
pub async fn discover_with_retry(
    scanner: &PciScanner,
    selector: &PciSelector,
    ladder: &BackoffLadder,
    stop: &mut watch::Receiver<bool>,
) -> Option<Vec<PciDevice>> {
    let mut attempt = 0;

    loop {
        if *stop.borrow() {
            return None;
        }

        let devices = scanner.scan(selector);
        if !devices.is_empty() {
            return Some(devices);
        }

        let delay = ladder.delay(attempt);
        attempt = ladder.next_attempt(attempt);
        info!(selector = %selector, retry_in = ?delay, "No PCI devices found");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(selector = %selector, "Stopped while discovering PCI devices");
                    return None;
                }
            }
        }
    }
}

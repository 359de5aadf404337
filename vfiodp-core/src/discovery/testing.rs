//! Fake host trees for tests.
//!
//! Builds a miniature host root with the sysfs PCI attributes and `/dev/vfio`
//! nodes the plugin reads, laid out the way [`crate::paths::HostPaths`]
//! expects them below `host_root`.

use crate::discovery::device::attr;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary host root populated with fake PCI devices.
pub struct FakePciTree {
    root: PathBuf,
    _dir: Option<TempDir>,
}

impl Default for FakePciTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePciTree {
    /// Create a tree in a fresh temporary directory, removed on drop.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp host root");
        let tree = Self { root: dir.path().to_path_buf(), _dir: Some(dir) };
        tree.init();
        tree
    }

    /// Operate on an existing tree without owning it.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let tree = Self { root: root.into(), _dir: None };
        tree.init();
        tree
    }

    fn init(&self) {
        fs::create_dir_all(self.pci_devices()).expect("create PCI device dir");
        fs::create_dir_all(self.vfio_nodes()).expect("create vfio dir");
        fs::create_dir_all(self.root.join("sys/bus/pci/drivers")).expect("create drivers dir");
        fs::create_dir_all(self.root.join("sys/kernel/iommu_groups")).expect("create groups dir");
    }

    /// Directory to use as `host_root`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pci_devices(&self) -> PathBuf {
        self.root.join("sys/bus/pci/devices")
    }

    pub fn vfio_nodes(&self) -> PathBuf {
        self.root.join("dev/vfio")
    }

    /// Add a device directory with the given attributes. `None` leaves the
    /// attribute out entirely.
    pub fn add_device(
        &self,
        address: &str,
        pci_id: &str,
        driver: Option<&str>,
        iommu_group: Option<&str>,
        numa_node: Option<&str>,
    ) -> PathBuf {
        let device = self.pci_devices().join(address);
        fs::create_dir_all(&device).expect("create device dir");

        fs::write(
            device.join(attr::UEVENT),
            format!("DRIVER={}\nPCI_ID={}\nPCI_SLOT_NAME={}\n", driver.unwrap_or(""), pci_id, address),
        )
        .expect("write uevent");

        if let Some(driver) = driver {
            let target = self.root.join("sys/bus/pci/drivers").join(driver);
            fs::create_dir_all(&target).expect("create driver dir");
            symlink(&target, device.join(attr::DRIVER)).expect("link driver");
        }

        if let Some(group) = iommu_group {
            let target = self.root.join("sys/kernel/iommu_groups").join(group);
            fs::create_dir_all(&target).expect("create group dir");
            symlink(&target, device.join(attr::IOMMU_GROUP)).expect("link iommu group");
        }

        if let Some(node) = numa_node {
            fs::write(device.join(attr::NUMA_NODE), format!("{}\n", node)).expect("write numa");
        }

        fs::write(device.join(attr::RESET), "").expect("write reset");
        device
    }

    /// Add a bare entry with no attributes at all.
    pub fn add_raw_entry(&self, address: &str) {
        fs::create_dir_all(self.pci_devices().join(address)).expect("create raw entry");
    }

    /// Remove the `reset` attribute so resets of this device fail.
    pub fn break_reset(&self, address: &str) {
        let _ = fs::remove_file(self.pci_devices().join(address).join(attr::RESET));
    }

    /// Contents of a device's `reset` attribute. Every reset appends a "1"
    /// until [`FakePciTree::clear_reset`] empties it again.
    pub fn reset_contents(&self, address: &str) -> String {
        fs::read_to_string(self.pci_devices().join(address).join(attr::RESET)).unwrap_or_default()
    }

    /// Number of resets written since creation or the last clear.
    pub fn reset_count(&self, address: &str) -> usize {
        self.reset_contents(address).matches('1').count()
    }

    pub fn clear_reset(&self, address: &str) {
        let _ = fs::write(self.pci_devices().join(address).join(attr::RESET), "");
    }

    /// Create the VFIO group node for `group`.
    pub fn add_vfio_node(&self, group: &str) -> PathBuf {
        let node = self.vfio_nodes().join(group);
        fs::write(&node, "").expect("create vfio node");
        node
    }

    pub fn remove_vfio_node(&self, group: &str) {
        let _ = fs::remove_file(self.vfio_nodes().join(group));
    }
}

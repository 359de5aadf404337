//! PCI device discovery for VFIO passthrough.
//!
//! Devices are picked out of the host PCI tree by `vendor:device` id and kept
//! only when they are bound to `vfio-pci` and sit in an IOMMU group.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Device Discovery                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PciScanner                                                 │
//! │  ├── scan() - uevent PCI_ID → driver → iommu_group → numa   │
//! │  └── discover_with_retry() - backoff until devices appear   │
//! │                                                             │
//! │  PciSelector                                                │
//! │  └── vvvv:dddd, compared case-insensitively                 │
//! │                                                             │
//! │  DeviceResetter                                             │
//! │  └── Function level reset via the sysfs reset attribute     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use vfiodp_core::discovery::{PciScanner, PciSelector};
//!
//! let scanner = PciScanner::new("/sys/bus/pci/devices", "vfio-pci");
//! let devices = scanner.scan(&PciSelector::parse("8086:0bda")?);
//! ```

mod device;
mod scan;
mod selector;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use device::{
    attr, parse_uevent_pci_id, read_numa_node, DeviceResetter, PciDevice, VFIO_PCI_DRIVER,
};
pub use scan::{discover_with_retry, PciScanner, SkipReason};
pub use selector::PciSelector;

//! Advertised device list and the IOMMU group → PCI address map behind it.
//!
//! Both halves are only ever rebuilt together through [`DeviceRegistry::replace`],
//! so every advertised id resolves to exactly one PCI address for the lifetime
//! of a discovery generation.

use crate::discovery::PciDevice;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Health of an advertised device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
}

impl DeviceHealth {
    /// Wire value used by the kubelet device plugin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceHealth::Healthy => "Healthy",
            DeviceHealth::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device as the kubelet sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedDevice {
    /// IOMMU group of the underlying PCI function
    pub id: String,
    pub health: DeviceHealth,
    /// NUMA node hint, if known
    pub numa_node: Option<i64>,
}

/// Device list plus id → address map for one discovery generation.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<ExposedDevice>,
    iommu_to_pci: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new(devices: &[PciDevice]) -> Self {
        let mut registry = Self::default();
        registry.replace(devices);
        registry
    }

    /// Rebuild the list and the map from scratch. All devices start Healthy.
    ///
    /// Returns the PCI addresses that were left out because another function
    /// already claimed their IOMMU group.
    pub fn replace(&mut self, devices: &[PciDevice]) -> Vec<String> {
        self.devices.clear();
        self.iommu_to_pci.clear();

        let mut shadowed = Vec::new();
        for device in devices {
            if let Some(existing) = self.iommu_to_pci.get(&device.iommu_group) {
                warn!(
                    iommu_group = %device.iommu_group,
                    address = %device.pci_address,
                    advertised = %existing,
                    "IOMMU group already advertised by another function, skipping"
                );
                shadowed.push(device.pci_address.clone());
                continue;
            }

            self.iommu_to_pci.insert(device.iommu_group.clone(), device.pci_address.clone());
            self.devices.push(ExposedDevice {
                id: device.iommu_group.clone(),
                health: DeviceHealth::Healthy,
                numa_node: device.numa_hint(),
            });
        }
        shadowed
    }

    /// Set the health of `id`. Returns true if the value actually changed.
    pub fn set_health(&mut self, id: &str, health: DeviceHealth) -> bool {
        match self.devices.iter_mut().find(|d| d.id == id) {
            Some(device) if device.health != health => {
                device.health = health;
                true
            }
            _ => false,
        }
    }

    /// Translate an advertised id back to its PCI address.
    pub fn resolve(&self, id: &str) -> Option<&str> {
        self.iommu_to_pci.get(id).map(String::as_str)
    }

    pub fn devices(&self) -> &[ExposedDevice] {
        &self.devices
    }

    /// PCI addresses of every currently known device, in advertisement order.
    pub fn pci_addresses(&self) -> Vec<String> {
        self.devices.iter().filter_map(|d| self.resolve(&d.id).map(str::to_string)).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, group: &str, numa_node: i32) -> PciDevice {
        PciDevice {
            pci_id: "8086:0bda".to_string(),
            driver: "vfio-pci".to_string(),
            pci_address: address.to_string(),
            iommu_group: group.to_string(),
            numa_node,
        }
    }

    #[test]
    fn test_registry_round_trips_discovery() {
        let devices = vec![device("0000:3d:00.0", "12", 0), device("0000:b3:00.0", "40", -1)];
        let registry = DeviceRegistry::new(&devices);

        for d in &devices {
            assert_eq!(registry.resolve(&d.iommu_group), Some(d.pci_address.as_str()));
        }
        assert_eq!(
            registry.devices(),
            &[
                ExposedDevice {
                    id: "12".to_string(),
                    health: DeviceHealth::Healthy,
                    numa_node: Some(0)
                },
                ExposedDevice {
                    id: "40".to_string(),
                    health: DeviceHealth::Healthy,
                    numa_node: None
                },
            ]
        );
    }

    #[test]
    fn test_replace_rebuilds_both_halves() {
        let mut registry = DeviceRegistry::new(&[device("0000:3d:00.0", "12", 0)]);
        registry.set_health("12", DeviceHealth::Unhealthy);

        registry.replace(&[device("0000:b3:00.0", "40", 1)]);

        assert_eq!(registry.resolve("12"), None);
        assert_eq!(registry.resolve("40"), Some("0000:b3:00.0"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].health, DeviceHealth::Healthy);
    }

    #[test]
    fn test_set_health_is_idempotent() {
        let mut registry = DeviceRegistry::new(&[device("0000:3d:00.0", "12", 0)]);

        assert!(!registry.set_health("12", DeviceHealth::Healthy));
        assert!(!registry.set_health("12", DeviceHealth::Healthy));
        assert_eq!(registry.devices().iter().filter(|d| d.id == "12").count(), 1);

        assert!(registry.set_health("12", DeviceHealth::Unhealthy));
        assert!(!registry.set_health("12", DeviceHealth::Unhealthy));
        assert!(!registry.set_health("99", DeviceHealth::Unhealthy));
    }

    #[test]
    fn test_shared_iommu_group_advertised_once() {
        let mut registry = DeviceRegistry::default();
        let shadowed =
            registry.replace(&[device("0000:3d:00.0", "12", 0), device("0000:3d:00.1", "12", 0)]);

        assert_eq!(shadowed, vec!["0000:3d:00.1".to_string()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("12"), Some("0000:3d:00.0"));
        assert_eq!(registry.pci_addresses(), vec!["0000:3d:00.0".to_string()]);
    }
}

//! Conversions from registry types to device plugin messages.

use std::path::Path;
use vfiodp_api::v1beta1::{Device, DeviceSpec, NumaNode, TopologyInfo};
use vfiodp_core::{DeviceHealth, ExposedDevice};

/// Permissions granted on every VFIO node handed to a container.
pub const VFIO_NODE_PERMISSIONS: &str = "mrw";

/// Prefix of the environment variable carrying allocated PCI addresses.
pub const PCI_RESOURCE_PREFIX: &str = "PCI_RESOURCE";

pub fn health_str(health: DeviceHealth) -> &'static str {
    match health {
        DeviceHealth::Healthy => vfiodp_api::HEALTHY,
        DeviceHealth::Unhealthy => vfiodp_api::UNHEALTHY,
    }
}

pub fn device(exposed: &ExposedDevice) -> Device {
    Device {
        id: exposed.id.clone(),
        health: health_str(exposed.health).to_string(),
        topology: exposed
            .numa_node
            .map(|id| TopologyInfo { nodes: vec![NumaNode { id }] }),
    }
}

pub fn devices(exposed: &[ExposedDevice]) -> Vec<Device> {
    exposed.iter().map(device).collect()
}

/// Device spec exposing `node` at the same path inside the container.
pub fn vfio_device_spec(node: &Path) -> DeviceSpec {
    let path = node.to_string_lossy().to_string();
    DeviceSpec {
        container_path: path.clone(),
        host_path: path,
        permissions: VFIO_NODE_PERMISSIONS.to_string(),
    }
}

/// `PCI_RESOURCE_<NAME>` with the resource name uppercased and `/`, `.`, `-`
/// turned into underscores.
pub fn resource_env_name(resource_name: &str) -> String {
    format!(
        "{}_{}",
        PCI_RESOURCE_PREFIX,
        resource_name.to_ascii_uppercase().replace(['/', '.', '-'], "_")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_env_name() {
        assert_eq!(resource_env_name("intel.com/gaudi"), "PCI_RESOURCE_INTEL_COM_GAUDI");
        assert_eq!(resource_env_name("example.org/qat-vf"), "PCI_RESOURCE_EXAMPLE_ORG_QAT_VF");
    }

    #[test]
    fn test_device_topology_only_when_known() {
        let known = ExposedDevice {
            id: "12".to_string(),
            health: DeviceHealth::Healthy,
            numa_node: Some(0),
        };
        let converted = device(&known);
        assert_eq!(converted.health, "Healthy");
        assert_eq!(converted.topology.unwrap().nodes, vec![NumaNode { id: 0 }]);

        let unknown = ExposedDevice { numa_node: None, health: DeviceHealth::Unhealthy, ..known };
        let converted = device(&unknown);
        assert_eq!(converted.health, "Unhealthy");
        assert!(converted.topology.is_none());
    }

    #[test]
    fn test_vfio_device_spec() {
        let spec = vfio_device_spec(Path::new("/dev/vfio/12"));
        assert_eq!(spec.container_path, "/dev/vfio/12");
        assert_eq!(spec.host_path, "/dev/vfio/12");
        assert_eq!(spec.permissions, "mrw");
    }
}

//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Discovery
    describe_counter!(
        "vfiodp_discovery_skipped_total",
        "PCI devices skipped during discovery (by reason: uevent, driver, iommu_group)"
    );
    describe_gauge!("vfiodp_devices_advertised", "Devices currently advertised (by resource)");

    // Kubelet interaction
    describe_counter!(
        "vfiodp_registrations_total",
        "Registration attempts with the kubelet (by resource, outcome)"
    );
    describe_counter!(
        "vfiodp_plugin_restarts_total",
        "Plugin serve sessions restarted (by resource, reason)"
    );

    // Devices
    describe_counter!(
        "vfiodp_device_resets_total",
        "Function level resets performed (by outcome: success, failure)"
    );
}

pub fn record_discovery_skip(reason: &str) {
    counter!("vfiodp_discovery_skipped_total", "reason" => reason.to_string()).increment(1);
}

pub fn set_devices_advertised(resource: &str, count: usize) {
    gauge!("vfiodp_devices_advertised", "resource" => resource.to_string()).set(count as f64);
}

pub fn record_registration(resource: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "vfiodp_registrations_total",
        "resource" => resource.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_reset(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("vfiodp_device_resets_total", "outcome" => outcome).increment(1);
}

pub fn record_plugin_restart(resource: &str, reason: &str) {
    counter!(
        "vfiodp_plugin_restarts_total",
        "resource" => resource.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

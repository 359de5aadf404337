//! Kubelet device plugin API.
//!
//! This crate carries the `v1beta1` device plugin protocol spoken between the
//! kubelet and `vfiodpd`. The protobuf definitions live in
//! `proto/deviceplugin.proto` and are code-generated via `tonic-build`.
//!
//! Both halves of the protocol are generated: the `DevicePlugin` server that
//! the daemon implements, and the `Registration` client it uses to announce
//! itself on the kubelet socket. The opposite halves are used by tests to play
//! the kubelet's role.

pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Protocol version sent in every registration request.
pub const VERSION: &str = "v1beta1";

/// Health value advertised for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Health value advertised for a device whose node disappeared.
pub const UNHEALTHY: &str = "Unhealthy";

//! Error types for the device plugin.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for device plugin operations.
pub type Result<T> = std::result::Result<T, DevicePluginError>;

/// Main error type for the device plugin.
#[derive(Error, Debug)]
pub enum DevicePluginError {
    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Invalid PCI selector '{selector}' (expected vvvv:dddd in hex)")]
    InvalidSelector { selector: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Device errors
    #[error("Unexpected sysfs attribute {path:?}: {reason}")]
    InvalidAttribute { path: PathBuf, reason: String },

    #[error("Function level reset failed for PCI device {pci_address}: {source}")]
    ResetFailed {
        pci_address: String,
        #[source]
        source: std::io::Error,
    },

    // Plugin server errors
    #[error("Failed to bind device plugin socket {path:?}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} connecting to {path:?}")]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    #[error("Failed to connect to {path:?}: {reason}")]
    ConnectFailed { path: PathBuf, reason: String },

    #[error("Registration of resource {resource_name} failed: {reason}")]
    RegistrationFailed { resource_name: String, reason: String },

    #[error("gRPC server for resource {resource_name} failed: {reason}")]
    ServeFailed { resource_name: String, reason: String },

    // Health monitoring errors
    #[error("Filesystem watcher error: {reason}")]
    WatcherFailed { reason: String },

    #[error("Failed to watch {path:?}: {reason}")]
    WatchPathFailed { path: PathBuf, reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DevicePluginError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }
}

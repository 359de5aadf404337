//! vfiodp core library
//!
//! Discovery, device registry and shared plumbing for the VFIO PCI device
//! plugin daemon.

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod error;
pub mod observability;
pub mod paths;
pub mod registry;
pub mod watcher;

// Re-export commonly used items
pub use backoff::BackoffLadder;
pub use config::{Config, ResourceConfig};
pub use discovery::{DeviceResetter, PciDevice, PciScanner, PciSelector};
pub use error::{DevicePluginError, Result};
pub use observability::init as init_observability;
pub use paths::HostPaths;
pub use registry::{DeviceHealth, DeviceRegistry, ExposedDevice};
pub use watcher::{
    FakeWatcherFactory, NotifyWatcherFactory, PathWatcher, WatchEvent, WatchEventKind,
    WatcherFactory,
};

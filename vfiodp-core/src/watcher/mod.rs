//! Path watching capability used by the health monitor.
//!
//! Health monitoring is driven purely by filesystem notifications. The
//! [`PathWatcher`] trait hides where those come from: [`NotifyWatcherFactory`]
//! is backed by the OS (inotify on Linux) through the `notify` crate, and
//! [`FakeWatcherFactory`] synthesizes events in memory for tests.
//!
//! A fresh watcher is created for every monitor run, so the monitor takes a
//! [`WatcherFactory`] rather than a watcher.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

mod fake;
mod os;

pub use fake::FakeWatcherFactory;
pub use os::NotifyWatcherFactory;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// The path appeared (created, or moved into place)
    Create,
    /// The path was deleted
    Remove,
    /// The path was moved away
    Rename,
    /// Anything else (attribute changes, writes)
    Other,
}

/// A single filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self { path: path.into(), kind }
    }
}

/// A set of watched paths delivering events for the paths themselves and
/// for direct children of watched directories.
#[async_trait]
pub trait PathWatcher: Send {
    /// Start watching `path` (non-recursively).
    fn watch(&mut self, path: &Path) -> Result<()>;

    /// Wait for the next event. `None` means the watcher is gone for good.
    async fn next_event(&mut self) -> Option<WatchEvent>;
}

/// Creates independent watchers.
pub trait WatcherFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn PathWatcher>>;
}

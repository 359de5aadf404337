//! Deterministic in-memory watcher.
//!
//! Events are injected with [`FakeWatcherFactory::emit`] and delivered to
//! every live watcher that watches either the path itself or its parent
//! directory, mirroring inotify semantics without touching the filesystem.

use super::{PathWatcher, WatchEvent, WatchEventKind, WatcherFactory};
use crate::error::{DevicePluginError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    watchers: Vec<Slot>,
    created: usize,
    fail_next_create: Option<String>,
}

struct Slot {
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Slot {
    fn covers(&self, path: &Path) -> bool {
        let watched = lock(&self.watched);
        watched.contains(path) || path.parent().is_some_and(|parent| watched.contains(parent))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory handing out fake watchers and injecting events into them.
#[derive(Clone, Default)]
pub struct FakeWatcherFactory {
    state: Arc<Mutex<FakeState>>,
}

impl FakeWatcherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live watcher covering `path`. Returns the
    /// number of watchers it reached.
    pub fn emit(&self, path: impl AsRef<Path>, kind: WatchEventKind) -> usize {
        let path = path.as_ref();
        let mut state = lock(&self.state);
        state.watchers.retain(|slot| !slot.tx.is_closed());

        state
            .watchers
            .iter()
            .filter(|slot| slot.covers(path))
            .filter(|slot| slot.tx.send(WatchEvent::new(path, kind)).is_ok())
            .count()
    }

    /// Number of watchers created so far.
    pub fn created(&self) -> usize {
        lock(&self.state).created
    }

    /// Paths watched by watchers that are still alive.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let state = lock(&self.state);
        state
            .watchers
            .iter()
            .filter(|slot| !slot.tx.is_closed())
            .flat_map(|slot| lock(&slot.watched).iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Make the next `create` call fail.
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next_create = Some(reason.into());
    }

    /// Poll until some live watcher watches `path`.
    pub async fn wait_for_watch(&self, path: impl AsRef<Path>, timeout: Duration) -> bool {
        let path = path.as_ref();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.watched_paths().iter().any(|p| p == path) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl WatcherFactory for FakeWatcherFactory {
    fn create(&self) -> Result<Box<dyn PathWatcher>> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_next_create.take() {
            return Err(DevicePluginError::WatcherFailed { reason });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = Arc::new(Mutex::new(HashSet::new()));
        state.watchers.push(Slot { watched: watched.clone(), tx });
        state.created += 1;

        Ok(Box::new(FakeWatcher { watched, events: rx }))
    }
}

/// Watcher half handed to the code under test.
pub struct FakeWatcher {
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

#[async_trait]
impl PathWatcher for FakeWatcher {
    fn watch(&mut self, path: &Path) -> Result<()> {
        lock(&self.watched).insert(path.to_path_buf());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

//! OS-backed watcher built on the `notify` crate.

use super::{PathWatcher, WatchEvent, WatchEventKind, WatcherFactory};
use crate::error::{DevicePluginError, Result};
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Creates [`NotifyWatcher`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyWatcherFactory;

impl WatcherFactory for NotifyWatcherFactory {
    fn create(&self) -> Result<Box<dyn PathWatcher>> {
        Ok(Box::new(NotifyWatcher::new()?))
    }
}

/// Bridges `notify`'s callback thread into an async event stream.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for translated in translate(event) {
                        // Receiver dropped means the monitor is done
                        let _ = tx.send(translated);
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watcher error"),
            }
        })
        .map_err(|e| DevicePluginError::WatcherFailed { reason: e.to_string() })?;

        Ok(Self { watcher, events })
    }
}

#[async_trait]
impl PathWatcher for NotifyWatcher {
    fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive).map_err(|e| {
            DevicePluginError::WatchPathFailed { path: path.to_path_buf(), reason: e.to_string() }
        })?;
        debug!(path = %path.display(), "Watching path");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

/// Flatten a `notify` event into one [`WatchEvent`] per path.
fn translate(event: notify::Event) -> Vec<WatchEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push(WatchEvent::new(from, WatchEventKind::Rename));
            }
            if let Some(to) = paths.next() {
                out.push(WatchEvent::new(to, WatchEventKind::Create));
            }
            out
        }
        kind => {
            let kind = classify(&kind);
            event.paths.into_iter().map(|path| WatchEvent::new(path, kind)).collect()
        }
    }
}

fn classify(kind: &EventKind) -> WatchEventKind {
    match kind {
        EventKind::Create(_) => WatchEventKind::Create,
        EventKind::Remove(_) => WatchEventKind::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Create,
        EventKind::Modify(ModifyKind::Name(_)) => WatchEventKind::Rename,
        _ => WatchEventKind::Other,
    }
}

//! Per-`start()` serving session.
//!
//! A session owns the event channel that feeds `ListAndWatch` streams and the
//! signals used to tear the server down. It moves through
//! NotStarted → Running → Stopped exactly once; [`Session::close`] is the
//! close-once guard.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use vfiodp_core::DeviceHealth;

/// Buffered events per `ListAndWatch` stream before it lags.
const EVENT_CAPACITY: usize = 64;

/// Events delivered to `ListAndWatch` streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    /// A device changed health; streams resend the full list
    DeviceHealthChanged { id: String, health: DeviceHealth },
    /// The process is shutting down
    Stop,
    /// The session ended for any other reason
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Running,
    Stopped,
}

pub struct Session {
    phase: Mutex<Phase>,
    events: broadcast::Sender<PluginEvent>,
    done: watch::Sender<bool>,
    deregistered: watch::Sender<bool>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (done, _) = watch::channel(false);
        let (deregistered, _) = watch::channel(false);
        Self { phase: Mutex::new(Phase::NotStarted), events, done, deregistered }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == Phase::Stopped
    }

    /// NotStarted → Running. A closed session stays closed.
    pub fn mark_running(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != Phase::NotStarted {
            return false;
        }
        *phase = Phase::Running;
        true
    }

    /// Move to Stopped. Only the call that performs the transition gets `true`.
    pub fn close(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Stopped {
            return false;
        }
        *phase = Phase::Stopped;
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: PluginEvent) {
        // No receivers just means no stream is open
        let _ = self.events.send(event);
    }

    /// Number of open `ListAndWatch` streams.
    pub fn stream_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn signal_done(&self) {
        self.done.send_replace(true);
    }

    /// Resolves once the session has been torn down.
    pub async fn finished(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn mark_deregistered(&self) {
        self.deregistered.send_replace(true);
    }

    /// Wait for a stream to send its final empty list.
    pub async fn wait_deregistered(&self, timeout: Duration) -> bool {
        let mut deregistered = self.deregistered.subscribe();
        let wait = async move { deregistered.wait_for(|d| *d).await.is_ok() };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_move_forward_once() {
        let session = Session::new();
        assert_eq!(session.phase(), Phase::NotStarted);

        assert!(session.mark_running());
        assert!(!session.mark_running());
        assert!(session.is_running());

        assert!(session.close());
        assert!(!session.close());
        assert!(!session.mark_running());
        assert!(session.is_stopped());
    }

    #[test]
    fn test_close_before_running() {
        let session = Session::new();
        assert!(session.close());
        assert!(!session.mark_running());
    }

    #[tokio::test]
    async fn test_finished_resolves_after_done() {
        let session = std::sync::Arc::new(Session::new());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.finished().await })
        };

        session.signal_done();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // Already done resolves immediately
        session.finished().await;
    }

    #[tokio::test]
    async fn test_wait_deregistered_times_out() {
        let session = Session::new();
        assert!(!session.wait_deregistered(Duration::from_millis(20)).await);

        session.mark_deregistered();
        assert!(session.wait_deregistered(Duration::from_millis(20)).await);
    }
}

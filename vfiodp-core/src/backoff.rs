//! Bounded backoff ladder shared by discovery retries and the restart loop.

use std::time::Duration;

/// Default retry ladder: 1s, 2s, 5s, 10s, then holding at 10s.
pub const DEFAULT_LADDER_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

/// A non-decreasing list of delays indexed by a capped attempt counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_LADDER_MS)
    }
}

impl BackoffLadder {
    /// Build a ladder from explicit steps.
    ///
    /// Steps are sorted so the ladder never decreases; an empty list falls
    /// back to the default ladder.
    pub fn new(mut steps: Vec<Duration>) -> Self {
        if steps.is_empty() {
            return Self::default();
        }
        steps.sort();
        Self { steps }
    }

    /// Build a ladder from millisecond values.
    pub fn from_millis(steps: &[u64]) -> Self {
        Self::new(steps.iter().copied().map(Duration::from_millis).collect())
    }

    /// Index of the last step; attempt counters never need to exceed it.
    pub fn max_attempt(&self) -> usize {
        self.steps.len() - 1
    }

    /// Delay for `attempt`, holding at the last step.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.steps[attempt.min(self.max_attempt())]
    }

    /// Advance a retry counter without running past the last step.
    pub fn next_attempt(&self, attempt: usize) -> usize {
        attempt.saturating_add(1).min(self.max_attempt())
    }
}

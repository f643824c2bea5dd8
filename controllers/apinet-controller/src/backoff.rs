//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciles, kept per object. The delay grows
//! along the Fibonacci sequence, slower than exponential backoff, so a
//! briefly unavailable dependency is retried soon while a persistently
//! failing object settles at the cap.
//!
//! Sequence with the defaults: 1s, 1s, 2s, 3s, 5s, 8s, ... capped at 5m.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Smallest delay, used for the first two failures.
pub const DEFAULT_MIN_SECONDS: u64 = 1;

/// Largest delay.
pub const DEFAULT_MAX_SECONDS: u64 = 300;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SECONDS, DEFAULT_MAX_SECONDS)
    }
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Returns the current delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;
        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = next.min(self.max_seconds);
        Duration::from_secs(result)
    }

    /// Restarts the sequence.
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Backoff state per object key (`kind/namespace/name`).
#[derive(Debug, Default)]
pub struct BackoffStates {
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffStates {
    /// Next delay for the object, advancing its sequence.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(key.to_string()).or_default().next_backoff()
    }

    /// Forgets the object's failures after a successful reconcile.
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}

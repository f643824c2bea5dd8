//! Per-object Fibonacci backoff for failed translations.
//!
//! Delays run 1s, 1s, 2s, 3s, 5s, ... up to two minutes; a successful
//! reconcile forgets the object.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const MIN_SECONDS: u64 = 1;
const MAX_SECONDS: u64 = 120;

/// `(previous, current)` delay in seconds.
type Sequence = (u64, u64);

#[derive(Debug, Default)]
pub struct BackoffStates {
    states: Mutex<HashMap<String, Sequence>>,
}

impl BackoffStates {
    /// Current delay for `key`; advances its sequence.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let (prev, current) = states.entry(key.to_string()).or_insert((0, MIN_SECONDS));
        let delay = *current;
        let next = prev.saturating_add(*current).min(MAX_SECONDS);
        *prev = *current;
        *current = next;
        Duration::from_secs(delay)
    }

    pub fn reset(&self, key: &str) {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_capped() {
        let states = BackoffStates::default();
        let secs: Vec<u64> = (0..12).map(|_| states.next_backoff("k").as_secs()).collect();
        assert_eq!(secs, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 120]);
    }

    #[test]
    fn test_reset_restarts_one_key() {
        let states = BackoffStates::default();
        states.next_backoff("a");
        states.next_backoff("a");
        states.next_backoff("b");
        states.reset("a");
        assert_eq!(states.next_backoff("a").as_secs(), 1);
        assert_eq!(states.next_backoff("b").as_secs(), 1);
        assert_eq!(states.next_backoff("b").as_secs(), 2);
    }
}

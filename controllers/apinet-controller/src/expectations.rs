//! Expectation tracker
//!
//! After a controller issues creates and deletes for a parent it records
//! the child names it expects to observe. Until every one of them has been
//! seen through the watch stream (or the record times out) the parent's
//! create/delete phase is skipped, so a reconcile working from a stale
//! cache does not create the same children twice.
//!
//! Records are keyed by `(kind, namespace, name)` and spread over a fixed
//! array of mutex-guarded shards.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::DEFAULT_EXPECTATION_TIMEOUT;

const SHARDS: usize = 16;

/// Identity of the parent object expectations are recorded for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ControllerKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug)]
struct Record {
    timestamp: Instant,
    pending_creates: HashSet<String>,
    pending_deletes: HashSet<String>,
}

impl Record {
    fn is_empty(&self) -> bool {
        self.pending_creates.is_empty() && self.pending_deletes.is_empty()
    }
}

/// Process-local expectation store.
#[derive(Debug)]
pub struct Expectations {
    timeout: Duration,
    shards: [Mutex<HashMap<ControllerKey, Record>>; SHARDS],
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATION_TIMEOUT)
    }
}

impl Expectations {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, key: &ControllerKey) -> MutexGuard<'_, HashMap<ControllerKey, Record>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % SHARDS as u64) as usize;
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the record of `key`.
    pub fn expect_creates_and_deletes(
        &self,
        key: &ControllerKey,
        creates: impl IntoIterator<Item = String>,
        deletes: impl IntoIterator<Item = String>,
    ) {
        let record = Record {
            timestamp: Instant::now(),
            pending_creates: creates.into_iter().collect(),
            pending_deletes: deletes.into_iter().collect(),
        };
        self.shard(key).insert(key.clone(), record);
    }

    pub fn creation_observed(&self, key: &ControllerKey, child: &str) {
        if let Some(record) = self.shard(key).get_mut(key) {
            record.pending_creates.remove(child);
        }
    }

    pub fn deletion_observed(&self, key: &ControllerKey, child: &str) {
        if let Some(record) = self.shard(key).get_mut(key) {
            record.pending_deletes.remove(child);
        }
    }

    /// True when nothing is pending for `key` or its record has expired.
    pub fn satisfied(&self, key: &ControllerKey) -> bool {
        match self.shard(key).get(key) {
            None => true,
            Some(record) => record.is_empty() || record.timestamp.elapsed() >= self.timeout,
        }
    }

    /// Forgets `key`.
    pub fn delete(&self, key: &ControllerKey) {
        self.shard(key).remove(key);
    }
}

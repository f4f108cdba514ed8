//! Bookkeeping for resources that repeatedly fail to retrieve.
//!
//! Each failed attempt marks a key. Once a key has been marked
//! `max_attempts` times it is reported absent until `min_check_interval`
//! has passed since the last mark, after which the entry is dropped and
//! the next attempt starts with a fresh counter.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct AbsentEntry {
    attempts: u32,
    last_marked: Instant,
}

/// Thread-safe absent-resource registry.
#[derive(Debug)]
pub struct AbsentResourceList<K> {
    max_attempts: u32,
    min_check_interval: Duration,
    entries: Mutex<HashMap<K, AbsentEntry>>,
}

impl<K: Eq + Hash> AbsentResourceList<K> {
    #[must_use]
    pub fn new(max_attempts: u32, min_check_interval: Duration) -> Self {
        Self {
            max_attempts,
            min_check_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn min_check_interval(&self) -> Duration {
        self.min_check_interval
    }

    /// Record a failed attempt for `key`.
    pub fn mark_resource_absent(&self, key: K) {
        self.mark_resource_absent_at(key, Instant::now());
    }

    pub fn mark_resource_absent_at(&self, key: K, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key).or_insert(AbsentEntry {
            attempts: 0,
            last_marked: now,
        });
        // A mark arriving after the cool-down starts a new round.
        if now.saturating_duration_since(entry.last_marked) >= self.min_check_interval {
            entry.attempts = 0;
        }
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_marked = now;
    }

    /// Forget every failure recorded for `key`.
    pub fn unmark_resource_absent(&self, key: &K) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[must_use]
    pub fn is_resource_absent(&self, key: &K) -> bool {
        self.is_resource_absent_at(key, Instant::now())
    }

    #[must_use]
    pub fn is_resource_absent_at(&self, key: &K, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(key) else {
            return false;
        };

        let elapsed = now.saturating_duration_since(entry.last_marked);
        if elapsed >= self.min_check_interval {
            entries.remove(key);
            return false;
        }
        entry.attempts >= self.max_attempts
    }

    /// Number of failures recorded for `key` in the current round.
    #[must_use]
    pub fn attempts(&self, key: &K) -> u32 {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |e| e.attempts)
    }
}

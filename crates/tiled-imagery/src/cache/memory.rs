//! Size-bounded LRU cache for decoded tiles.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Fraction of the capacity eviction shrinks the cache to.
const LOW_WATER_RATIO: f64 = 0.8;

/// A thread-safe in-memory cache bounded by the total size of its entries.
///
/// When an insertion would exceed the capacity, least recently used entries
/// are evicted until the used size drops to the low-water mark.
#[derive(Debug)]
pub struct MemoryCache<K, V> {
    inner: Mutex<MemoryCacheInner<K, V>>,
}

#[derive(Debug)]
struct MemoryCacheInner<K, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: usize,
    low_water: usize,
    used: usize,
    /// Monotonic access counter used as the LRU clock.
    clock: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    size: usize,
    last_used: u64,
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn low_water_for(capacity: usize) -> usize {
    (capacity as f64 * LOW_WATER_RATIO) as usize
}

impl<K: Eq + Hash + Clone, V: Clone> MemoryCache<K, V> {
    /// Create a cache holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_low_water(capacity, low_water_for(capacity))
    }

    #[must_use]
    pub fn with_low_water(capacity: usize, low_water: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryCacheInner {
                entries: HashMap::new(),
                capacity,
                low_water: low_water.min(capacity),
                used: 0,
                clock: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryCacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an entry. Returns `false` if the entry alone is
    /// larger than the cache.
    pub fn put(&self, key: K, value: V, size: usize) -> bool {
        let mut inner = self.lock();
        if size > inner.capacity {
            return false;
        }

        if let Some(old) = inner.entries.remove(&key) {
            inner.used -= old.size;
        }
        if inner.used + size > inner.capacity {
            let target = inner.low_water.saturating_sub(size);
            inner.evict_to(target);
        }

        inner.clock += 1;
        let last_used = inner.clock;
        inner.entries.insert(
            key,
            Entry {
                value,
                size,
                last_used,
            },
        );
        inner.used += size;
        true
    }

    /// Fetch an entry, marking it as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = clock;
            entry.value.clone()
        })
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(key)?;
        inner.used -= entry.size;
        Some(entry.value)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.used = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    #[must_use]
    pub fn used_capacity(&self) -> usize {
        self.lock().used
    }

    /// Change the capacity, evicting down to the new low-water mark if needed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.lock();
        inner.capacity = capacity;
        inner.low_water = low_water_for(capacity);
        if inner.used > capacity {
            let target = inner.low_water;
            inner.evict_to(target);
        }
    }
}

impl<K: Eq + Hash + Clone, V> MemoryCacheInner<K, V> {
    fn evict_to(&mut self, target: usize) {
        let mut by_age: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_used, k.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(last_used, _)| *last_used);

        for (_, key) in by_age {
            if self.used <= target {
                break;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.used -= entry.size;
            }
        }
    }
}

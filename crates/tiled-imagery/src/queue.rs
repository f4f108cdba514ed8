//! The per-frame queue of pending tile loads.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::tile::{GpuTextureTile, TileKey};

/// A pending load for one tile.
///
/// Two requests are equal when they name the same tile; the priority only
/// orders them.
#[derive(Debug, Clone)]
pub struct RequestTask {
    pub priority: f64,
    pub tile: Arc<GpuTextureTile>,
}

impl RequestTask {
    #[must_use]
    pub fn new(tile: Arc<GpuTextureTile>, priority: f64) -> Self {
        Self { priority, tile }
    }

    #[must_use]
    pub fn key(&self) -> &TileKey {
        self.tile.key()
    }
}

impl PartialEq for RequestTask {
    fn eq(&self, other: &Self) -> bool {
        self.tile.key() == other.tile.key()
    }
}

impl Eq for RequestTask {}

impl PartialOrd for RequestTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.tile.key().cmp(other.tile.key()))
    }
}

/// Min-priority queue of load requests with duplicate suppression.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: BinaryHeap<Reverse<RequestTask>>,
    queued: HashSet<TileKey>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns `false` if the tile is already queued; the
    /// earlier entry keeps its priority.
    pub fn add(&mut self, task: RequestTask) -> bool {
        if !self.queued.insert(task.key().clone()) {
            return false;
        }
        self.heap.push(Reverse(task));
        true
    }

    /// Remove the request with the lowest priority value.
    pub fn poll(&mut self) -> Option<RequestTask> {
        let Reverse(task) = self.heap.pop()?;
        self.queued.remove(task.key());
        Some(task)
    }

    #[must_use]
    pub fn contains(&self, key: &TileKey) -> bool {
        self.queued.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }
}

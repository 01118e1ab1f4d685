//! Result Store
//!
//! Bounded, newest-first history of marker matches plus the set of block
//! hashes already inspected. All state sits behind one mutex that is never
//! held across an await point.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::inspector::MatchRecord;

/// Default number of matches kept in memory
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Inner {
    results: VecDeque<MatchRecord>,
    processed: HashSet<String>,
}

/// In-memory match history with per-block dedup
#[derive(Debug)]
pub struct ResultStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store keeping at most `capacity` matches (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark a block hash as processed
    ///
    /// # Returns
    /// `true` the first time a hash is seen, `false` afterwards
    pub fn record_if_new(&self, block_hash: &str) -> bool {
        let mut inner = self.lock();
        if inner.processed.contains(block_hash) {
            return false;
        }
        inner.processed.insert(block_hash.to_string())
    }

    /// Whether a block hash was already processed
    pub fn is_processed(&self, block_hash: &str) -> bool {
        self.lock().processed.contains(block_hash)
    }

    /// Prepend a match, evicting the oldest beyond capacity
    ///
    /// # Returns
    /// `false` if a match for the same block hash is already stored
    pub fn insert(&self, record: MatchRecord) -> bool {
        let mut inner = self.lock();
        if inner.results.iter().any(|r| r.block_hash == record.block_hash) {
            return false;
        }
        inner.results.push_front(record);
        while inner.results.len() > self.capacity {
            inner.results.pop_back();
        }
        true
    }

    /// Copy of the stored matches, newest first
    pub fn snapshot(&self) -> Vec<MatchRecord> {
        self.lock().results.iter().cloned().collect()
    }

    /// Number of stored matches
    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of block hashes processed so far
    pub fn processed_count(&self) -> usize {
        self.lock().processed.len()
    }

    /// Count of stored matches per pool name
    pub fn pool_distribution(&self) -> BTreeMap<String, usize> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        for record in &inner.results {
            *counts.entry(record.pool.name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

//! In-memory cache tier: thread-safe LRU bounded by entry count and bytes.
//!
//! Tracks both the number of resident entries and their cumulative estimated
//! memory, evicting least-recently-used entries until both budgets hold.
//! All operations are thread-safe behind one mutex; no caller observes a
//! structure over either budget.

use crate::bitmap::Bitmap;
use crate::key::{CacheKey, ContentSignature};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A resident thumbnail plus the signature it was produced from. Evicted
/// wholesale — there are no partial entries.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub bitmap: Arc<Bitmap>,
    pub signature: ContentSignature,
}

/// Thread-safe LRU cache with entry-count and byte budgets.
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
}

struct Slot {
    entry: MemoryEntry,
    bytes: usize,
    stamp: u64,
}

struct MemoryCacheInner {
    data: HashMap<CacheKey, Slot>,
    total_bytes: usize,
    max_bytes: usize,
    max_entries: usize,
    access_counter: u64,
    hits: u64,
    misses: u64,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryCacheInner {
                data: HashMap::new(),
                total_bytes: 0,
                max_bytes,
                max_entries,
                access_counter: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Get an entry, marking it most recently used. Counts a hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<MemoryEntry> {
        let mut inner = self.inner.lock();
        inner.get(key)
    }

    /// Insert or replace an entry, then evict least-recently-used entries
    /// until both budgets hold. An entry whose own estimated size exceeds
    /// the byte budget leaves the cache empty rather than over budget.
    pub fn put(&self, key: CacheKey, entry: MemoryEntry) {
        let mut inner = self.inner.lock();
        inner.put(key, entry);
    }

    /// Remove an entry; reports whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        inner.remove(key)
    }

    /// Drop all entries and reset counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.lock().max_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.inner.lock().max_entries
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.inner.lock().misses
    }
}

impl MemoryCacheInner {
    fn get(&mut self, key: &CacheKey) -> Option<MemoryEntry> {
        self.access_counter += 1;
        let stamp = self.access_counter;
        match self.data.get_mut(key) {
            Some(slot) => {
                slot.stamp = stamp;
                self.hits += 1;
                Some(slot.entry.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: CacheKey, entry: MemoryEntry) {
        self.access_counter += 1;
        let bytes = entry.bitmap.estimated_resident_bytes();

        if let Some(old) = self.data.insert(
            key,
            Slot {
                entry,
                bytes,
                stamp: self.access_counter,
            },
        ) {
            self.total_bytes = self.total_bytes.saturating_sub(old.bytes);
        }
        self.total_bytes = self.total_bytes.saturating_add(bytes);

        while (self.data.len() > self.max_entries || self.total_bytes > self.max_bytes)
            && !self.data.is_empty()
        {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .data
            .iter()
            .min_by_key(|(_, slot)| slot.stamp)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.data.remove(key) {
            Some(slot) => {
                self.total_bytes = self.total_bytes.saturating_sub(slot.bytes);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.total_bytes = 0;
        self.access_counter = 0;
        self.hits = 0;
        self.misses = 0;
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryCache")
            .field("len", &inner.data.len())
            .field("total_bytes", &inner.total_bytes)
            .field("max_bytes", &inner.max_bytes)
            .field("max_entries", &inner.max_entries)
            .finish()
    }
}

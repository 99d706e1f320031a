// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Bounded concurrent memo cache, scoped to one base revision

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::store::TagRef;

/// Memo cache statistics
#[derive(Debug, Default, Clone)]
pub struct MemoCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub current_entries: usize,
}

impl MemoCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct MemoEntry {
    set: Arc<Vec<TagRef>>,
    last_used: AtomicU64,
}

/// Concurrent memoization cache with insert-if-absent semantics.
///
/// Entries belong to exactly one base revision; the whole cache is dropped
/// when `current_rev` advances. Readers never block writers: lookups and
/// inserts go through the sharded map, and eviction scans only when the
/// entry count crosses the bound.
pub struct MemoCache {
    capacity: usize,
    rev: AtomicU64,
    tick: AtomicU64,
    entries: DashMap<(u64, u64), MemoEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl MemoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rev: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a memoized result for the given base revision.
    pub fn get(&self, rev: u64, key: (u64, u64)) -> Option<Arc<Vec<TagRef>>> {
        if self.rev.load(Ordering::Acquire) != rev {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.entries.get(&key) {
            Some(entry) => {
                entry
                    .last_used
                    .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.set.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert-if-absent for the given base revision; stale-revision inserts
    /// are dropped silently.
    pub fn insert(&self, rev: u64, key: (u64, u64), set: Arc<Vec<TagRef>>) {
        if self.rev.load(Ordering::Acquire) != rev {
            return;
        }
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        self.entries.entry(key).or_insert_with(|| {
            self.insertions.fetch_add(1, Ordering::Relaxed);
            MemoEntry {
                set,
                last_used: AtomicU64::new(tick),
            }
        });
        if self.entries.len() > self.capacity {
            self.evict_one();
        }
    }

    /// Drop every entry and rebind the cache to a new base revision.
    pub fn invalidate(&self, new_rev: u64) {
        self.rev.store(new_rev, Ordering::Release);
        self.entries.clear();
        debug!("memo cache invalidated, now scoped to rev {}", new_rev);
    }

    pub fn stats(&self) -> MemoCacheStats {
        MemoCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_entries: self.entries.len(),
        }
    }

    fn evict_one(&self) {
        let mut oldest: Option<((u64, u64), u64)> = None;
        for entry in self.entries.iter() {
            let used = entry.last_used.load(Ordering::Relaxed);
            if oldest.as_ref().map(|(_, u)| used < *u).unwrap_or(true) {
                oldest = Some((*entry.key(), used));
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("rev", &self.rev.load(Ordering::Relaxed))
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rev_scoping() {
        let cache = MemoCache::new(16);
        cache.invalidate(1);
        cache.insert(1, (1, 2), Arc::new(vec![TagRef::new(1)]));
        assert!(cache.get(1, (1, 2)).is_some());
        // Reads at another rev miss; advancing the rev clears everything.
        assert!(cache.get(2, (1, 2)).is_none());
        cache.invalidate(2);
        assert!(cache.get(2, (1, 2)).is_none());
    }

    #[test]
    fn test_bounded_eviction() {
        let cache = MemoCache::new(2);
        cache.invalidate(1);
        for i in 0..5u64 {
            cache.insert(1, (i, i), Arc::new(vec![]));
        }
        assert!(cache.entries.len() <= 3);
        assert!(cache.stats().evictions >= 2);
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let cache = MemoCache::new(4);
        cache.invalidate(1);
        cache.insert(1, (9, 9), Arc::new(vec![TagRef::new(1)]));
        cache.insert(1, (9, 9), Arc::new(vec![TagRef::new(2)]));
        assert_eq!(cache.get(1, (9, 9)).unwrap().as_slice(), &[TagRef::new(1)]);
    }
}

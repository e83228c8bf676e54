//! Managed LRU cache
//!
//! A byte-accounted LRU cache whose capacity is not fixed but granted by
//! the [`CacheManager`]. It grows by asking the manager for budget, reports
//! usage after every insert, and evicts least-recently-used entries when the
//! manager applies pressure.

use crate::cache::{CacheHandle, CacheManager, CacheRegistrant};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::warn;
use xstore_common::Result;

/// Individual cache entry with LRU tracking
struct CacheEntry {
    data: Bytes,
    /// Logical clock value of the last access
    last_access: AtomicU64,
}

impl CacheEntry {
    const fn new(data: Bytes, clock: u64) -> Self {
        Self {
            data,
            last_access: AtomicU64::new(clock),
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Entries evicted to stay within the allocation
    pub evictions: AtomicU64,
    /// Inserts that did not fit even after evicting everything
    pub rejected: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// LRU cache sized by the cache manager
pub struct ManagedCache<K> {
    entries: RwLock<HashMap<K, CacheEntry>>,
    used_bytes: AtomicU64,
    /// Bytes pushed out for lack of room since the last rebalance
    displaced_bytes: AtomicU64,
    clock: AtomicU64,
    stats: CacheStats,
    manager: Weak<CacheManager>,
    handle: OnceLock<CacheHandle>,
}

impl<K> ManagedCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a cache and register it with `manager`
    pub fn register(
        manager: &Arc<CacheManager>,
        name: &str,
        min_share: u64,
        max_share: u64,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            used_bytes: AtomicU64::new(0),
            displaced_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
            manager: Arc::downgrade(manager),
            handle: OnceLock::new(),
        });

        let handle = manager.register(name, min_share, max_share, cache.clone())?;
        // Freshly built, so the cell is empty
        let _ = cache.handle.set(handle);
        Ok(cache)
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an entry
    pub fn get(&self, key: &K) -> Option<Bytes> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(key) {
            entry.touch(self.tick());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert an entry, growing or evicting as needed.
    ///
    /// Returns false when the value does not fit in the cache at all.
    pub fn insert(&self, key: K, data: Bytes) -> bool {
        let size = data.len() as u64;
        let limit = self.reserve(size);
        let clock = self.tick();

        let inserted = {
            let mut entries = self.entries.write();
            if let Some(old) = entries.remove(&key) {
                self.used_bytes.fetch_sub(old.size(), Ordering::Relaxed);
            }

            let mut used = self.used_bytes.load(Ordering::Relaxed);
            while used + size > limit {
                let Some(evicted) = self.evict_lru(&mut entries) else {
                    break;
                };
                self.displaced_bytes.fetch_add(evicted, Ordering::Relaxed);
                used -= evicted;
            }

            if used + size > limit {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                entries.insert(key, CacheEntry::new(data, clock));
                self.used_bytes.fetch_add(size, Ordering::Relaxed);
                true
            }
        };

        // Reported with the entry lock released; the manager may call back
        self.report_usage();
        inserted
    }

    /// Remove an entry
    pub fn invalidate(&self, key: &K) -> Option<Bytes> {
        let removed = self.entries.write().remove(key)?;
        self.used_bytes.fetch_sub(removed.size(), Ordering::Relaxed);
        self.report_usage();
        Some(removed.data)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        {
            let mut entries = self.entries.write();
            entries.clear();
            self.used_bytes.store(0, Ordering::Relaxed);
        }
        self.report_usage();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bytes held by cached values
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn handle(&self) -> Option<&CacheHandle> {
        self.handle.get()
    }

    /// Make room for `size` more bytes, returning how many bytes may be held.
    ///
    /// Growth asks for enough allocation that the cache stays under the
    /// manager's pressure line once the new value is in.
    fn reserve(&self, size: u64) -> u64 {
        let (Some(manager), Some(handle)) = (self.manager.upgrade(), self.handle.get()) else {
            return 0;
        };

        let threshold = manager.pressure_threshold();
        let allocation = manager.allocation(handle).unwrap_or(0);
        let needed = self.used_bytes() + size;
        let wanted = (needed as f64 / threshold).ceil() as u64;
        if wanted <= allocation {
            return fill_limit(allocation, threshold);
        }

        let allocation = match manager.request_grow(handle, wanted - allocation) {
            Ok(granted) => allocation + granted,
            Err(e) => {
                warn!(cache = handle.name(), error = %e, "cache growth request failed");
                allocation
            }
        };
        fill_limit(allocation, threshold)
    }

    fn report_usage(&self) {
        if let (Some(manager), Some(handle)) = (self.manager.upgrade(), self.handle.get()) {
            if let Err(e) = manager.notify_usage(handle, self.used_bytes()) {
                warn!(cache = handle.name(), error = %e, "failed to report cache usage");
            }
        }
    }

    /// Remove the least recently used entry, returning its size
    fn evict_lru(&self, entries: &mut HashMap<K, CacheEntry>) -> Option<u64> {
        let key = entries
            .iter()
            .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone())?;
        let entry = entries.remove(&key)?;
        self.used_bytes.fetch_sub(entry.size(), Ordering::Relaxed);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        Some(entry.size())
    }
}

/// Bytes that fit in `allocation` without crossing the pressure line
fn fill_limit(allocation: u64, threshold: f64) -> u64 {
    (allocation as f64 * threshold) as u64
}

impl<K> CacheRegistrant for ManagedCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn requested_share(&self) -> u64 {
        self.used_bytes() + self.displaced_bytes.swap(0, Ordering::Relaxed)
    }

    fn eviction_pressure(&self, target: u64) -> u64 {
        let mut entries = self.entries.write();
        while self.used_bytes() > target {
            if self.evict_lru(&mut entries).is_none() {
                break;
            }
        }
        self.used_bytes()
    }
}

//! In-memory content cache with TTL expiry and LRU eviction
//!
//! TTL bounds staleness against an unwatched filesystem, LRU bounds memory.
//! Expiry is lazy: an entry past its deadline is dropped when it is next
//! looked up, or preferred as a victim when a `put` needs room.
//!
//! The index lives behind one mutex that is only held for map updates, never
//! across I/O. Loading a missing resource is coordinated separately through
//! per-key gates (see [`ContentCache::lock_key`]) so that concurrent misses on
//! the same key perform a single disk read while different keys load in
//! parallel.

use crate::config::CacheConfig;
use crate::models::{content_etag, CacheKey, ResourceMeta};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// A cached resource body and its validators
///
/// Entries are immutable once built. Content changes produce a new entry
/// with a new ETag via [`ContentCache::put`].
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    body: Bytes,
    content_type: String,
    etag: String,
    last_modified: SystemTime,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Cheap clone of the cached bytes
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// True once `now` has reached the expiry deadline
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Validators for the conditional evaluator
    pub fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            size: self.body.len() as u64,
            content_type: self.content_type.clone(),
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Bodies that were too large to retain under the byte bound
    pub rejected: u64,
}

impl CacheStats {
    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Index slot: the shared entry plus its recency bookkeeping
struct Slot {
    entry: Arc<CacheEntry>,
    last_accessed_at: Instant,
    /// Position in the recency order; unique and monotonic per cache
    access_seq: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<CacheKey, Slot>,
    /// access_seq -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    total_bytes: usize,
    next_seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.access_seq);
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size());
        Some(slot)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    rejected: AtomicU64,
}

type GateMap = Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>;

/// Shared content cache used by every connection task
pub struct ContentCache {
    state: Mutex<CacheState>,
    gates: GateMap,
    max_entries: usize,
    max_bytes: Option<usize>,
    counters: Counters,
}

impl ContentCache {
    /// Create a cache bounded by entry count and, optionally, total bytes
    pub fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        ContentCache {
            state: Mutex::new(CacheState::default()),
            gates: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            max_bytes,
            counters: Counters::default(),
        }
    }

    /// Create a cache from the `cache` section of the server configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_bytes)
    }

    // Every update leaves the index consistent, so poisoning is ignored
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry
    ///
    /// Returns `None` when the key is absent or its entry has expired; an
    /// expired entry is removed on the spot. A hit moves the entry to the
    /// most-recently-used position.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        let mut state = self.lock_state();

        let expired = match state.slots.get(key) {
            Some(slot) => slot.entry.is_expired_at(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss: key={}", key);
                return None;
            }
        };

        if expired {
            state.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache entry expired: key={}", key);
            return None;
        }

        let seq = state.next_seq();
        let CacheState { slots, recency, .. } = &mut *state;
        let slot = slots.get_mut(key)?;
        recency.remove(&slot.access_seq);
        recency.insert(seq, key.clone());
        slot.access_seq = seq;
        slot.last_accessed_at = now;

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!("Cache hit: key={}, size={}", key, slot.entry.size());
        Some(Arc::clone(&slot.entry))
    }

    /// Insert or replace an entry
    ///
    /// Computes the ETag from `body`, sets the expiry to `now + ttl` and evicts
    /// until the cache is back within its bounds. The new entry is never its
    /// own eviction victim. A body larger than the byte bound is returned to
    /// the caller but not retained, and any older entry for the key is dropped.
    pub fn put(
        &self,
        key: CacheKey,
        body: Bytes,
        content_type: impl Into<String>,
        last_modified: SystemTime,
        ttl: Duration,
    ) -> Arc<CacheEntry> {
        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            etag: content_etag(&body),
            key: key.clone(),
            body,
            content_type: content_type.into(),
            last_modified,
            created_at: now,
            expires_at: now + ttl,
        });
        let size = entry.size();

        let mut state = self.lock_state();

        if self.max_bytes.is_some_and(|max| size > max) {
            if state.remove(&key).is_some() {
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Entry too large to cache: key={}, size={}", key, size);
            return entry;
        }

        state.remove(&key);
        let seq = state.next_seq();
        state.recency.insert(seq, key.clone());
        state.total_bytes += size;
        state.slots.insert(
            key.clone(),
            Slot {
                entry: Arc::clone(&entry),
                last_accessed_at: now,
                access_seq: seq,
            },
        );
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        debug!("Stored entry in cache: key={}, size={}, etag={}", key, size, entry.etag);

        self.evict(&mut state, now, &key);
        entry
    }

    /// Remove an entry if present; calling it again is a no-op
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.lock_state().remove(key).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!("Invalidated cache entry: key={}", key);
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.slots.clear();
        state.recency.clear();
        state.total_bytes = 0;
    }

    fn over_bounds(&self, state: &CacheState) -> bool {
        state.slots.len() > self.max_entries
            || self.max_bytes.is_some_and(|max| state.total_bytes > max)
    }

    /// Evict until within bounds: expired entries first (oldest access
    /// first), then the least recently accessed valid entries.
    fn evict(&self, state: &mut CacheState, now: Instant, protect: &CacheKey) {
        while self.over_bounds(state) {
            let expired = state
                .recency
                .values()
                .find(|k| *k != protect && state.slots[*k].entry.is_expired_at(now))
                .cloned();

            let (victim, was_expired) = match expired {
                Some(key) => (key, true),
                None => match state.recency.values().find(|k| *k != protect).cloned() {
                    Some(key) => (key, false),
                    None => break,
                },
            };

            state.remove(&victim);
            if was_expired {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Evicted cache entry: key={}, expired={}", victim, was_expired);
        }
    }

    /// Wait for exclusive loading rights on `key`
    ///
    /// Handlers that miss take this gate, look the key up again, and only
    /// read from disk if it is still absent. The gate is released when the
    /// returned guard is dropped.
    pub async fn lock_key(&self, key: &CacheKey) -> KeyGuard<'_> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let guard = gate.lock_owned().await;

        KeyGuard {
            gates: &self.gates,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a load in progress or waiting
    pub fn pending_loads(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Last access time of a cached key, if present
    pub fn last_accessed_at(&self, key: &CacheKey) -> Option<Instant> {
        self.lock_state().slots.get(key).map(|slot| slot.last_accessed_at)
    }

    /// Whether `key` currently has an entry, expired or not, without touching
    /// its recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock_state().slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock_state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = {
            let state = self.lock_state();
            (state.slots.len(), state.total_bytes)
        };

        CacheStats {
            entries,
            total_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive loading rights on one cache key
pub struct KeyGuard<'a> {
    gates: &'a GateMap,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the gate before inspecting the map so our own Arc is gone
        drop(self.guard.take());

        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = gates.get(&self.key) {
            // Only the map still references it: nobody is waiting
            if Arc::strong_count(gate) == 1 {
                gates.remove(&self.key);
            }
        }
    }
}

//! Content-addressed result cache with TTL expiry and a capacity bound.
//!
//! Eviction is least-recently-inserted: lookups never refresh an entry, and
//! re-inserting a key replaces the entry and makes it the newest.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::schema::RecognitionResult;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    result: Arc<RecognitionResult>,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion sequence → key, oldest first.
    order: BTreeMap<u64, Fingerprint>,
    next_seq: u64,
}

/// Shared result cache. Cloning shares the underlying store.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<RwLock<CacheState>>,
    ttl: Duration,
    capacity: usize,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheState::default())),
            ttl,
            capacity,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheState>, CacheError> {
        self.inner.read().map_err(|_| CacheError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>, CacheError> {
        self.inner.write().map_err(|_| CacheError::Poisoned)
    }

    /// Fresh result for `key`, or `None` on miss. Expired entries count as a
    /// miss and are left for [`ResultCache::evict_expired`].
    pub fn lookup(&self, key: &Fingerprint) -> Option<Arc<RecognitionResult>> {
        self.lookup_at(key, Instant::now())
    }

    pub fn lookup_at(&self, key: &Fingerprint, now: Instant) -> Option<Arc<RecognitionResult>> {
        let found = match self.read() {
            Ok(state) => state
                .entries
                .get(key)
                .filter(|entry| now.saturating_duration_since(entry.inserted_at) < self.ttl)
                .map(|entry| entry.result.clone()),
            Err(e) => {
                warn!("Cache lookup degraded to miss: {}", e);
                None
            }
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store `result` under `key`, evicting the oldest insert when full.
    pub fn insert(&self, key: Fingerprint, result: Arc<RecognitionResult>) {
        self.insert_at(key, result, Instant::now());
    }

    pub fn insert_at(&self, key: Fingerprint, result: Arc<RecognitionResult>, now: Instant) {
        if self.capacity == 0 {
            return;
        }

        let mut state = match self.write() {
            Ok(state) => state,
            Err(e) => {
                warn!("Skipping cache insert for {}: {}", key, e);
                return;
            }
        };

        if let Some(previous) = state.entries.remove(&key) {
            state.order.remove(&previous.seq);
        } else if state.entries.len() >= self.capacity {
            if let Some((_, oldest)) = state.order.pop_first() {
                state.entries.remove(&oldest);
                debug!("Cache full, evicted {}", oldest);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key);
        state.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: now,
                seq,
            },
        );
    }

    /// Remove every entry older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut state = match self.write() {
            Ok(state) => state,
            Err(e) => {
                warn!("Skipping cache sweep: {}", e);
                return 0;
            }
        };

        let ttl = self.ttl;
        let expired: Vec<(Fingerprint, u64)> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.inserted_at) >= ttl)
            .map(|(key, entry)| (*key, entry.seq))
            .collect();

        for (key, seq) in &expired {
            state.entries.remove(key);
            state.order.remove(seq);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            ttl_seconds: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

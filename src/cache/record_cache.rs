use crate::idempotency::storage::{IdempotencyRecord, IdempotencyStatus};
use crate::observability::get_metrics;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    pub invalidations: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_insertions(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    pub fn get_invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

/// Settings for the per-process record cache.
#[derive(Debug, Clone)]
pub struct RecordCacheSettings {
    pub max_items: u64,
    pub ttl: Duration,
}

impl Default for RecordCacheSettings {
    fn default() -> Self {
        Self {
            max_items: 256,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Per-process read-through cache of completed records.
///
/// Only COMPLETED records are held. The cache never decides whether a key
/// may be claimed; a miss always falls through to the store.
pub struct RecordCache {
    cache: Cache<String, IdempotencyRecord>,
    stats: Arc<CacheStats>,
}

impl RecordCache {
    pub fn new(settings: RecordCacheSettings) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(settings.max_items)
                .time_to_live(settings.ttl)
                .build(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    /// Returns a completed record that has not passed its own expiry.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        match self.cache.get(key) {
            Some(record) if !record.is_expired(now) => {
                self.stats.record_hit();
                get_metrics().record_cache_lookup(true);
                tracing::debug!(idempotency_key = %key, "Idempotency record found in local cache");
                Some(record)
            }
            Some(_) => {
                tracing::debug!(idempotency_key = %key, "Removing expired local cache record");
                self.invalidate(key);
                self.stats.record_miss();
                get_metrics().record_cache_lookup(false);
                None
            }
            None => {
                self.stats.record_miss();
                get_metrics().record_cache_lookup(false);
                None
            }
        }
    }

    /// Caches a record if it is COMPLETED. Other statuses can change outside
    /// this process and are ignored.
    pub fn put(&self, record: &IdempotencyRecord) {
        if record.status != IdempotencyStatus::Completed {
            return;
        }
        self.cache
            .insert(record.idempotency_key.clone(), record.clone());
        self.stats.record_insertion();
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
        self.stats.record_invalidation();
    }

    /// Approximate number of entries; pending maintenance may lag.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new(RecordCacheSettings::default())
    }
}

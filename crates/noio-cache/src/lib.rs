//! Bounded write-back cache of sentence metadata.
//!
//! Reads go through to the backing store on a miss; writes stay local and are
//! marked dirty until a flush persists them. The least-recently-used entry is
//! evicted when the cache grows past capacity, and a dirty entry is written
//! before it leaves. If that write fails the entry is parked, still dirty,
//! until the next flush.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use noio_core::config::CacheSettings;
use noio_core::error::{Error, Result};
use noio_core::traits::{MetadataLookup, MetadataStore};
use noio_core::types::MetadataRecord;

#[derive(Debug, Clone)]
struct CacheEntry {
    record: MetadataRecord,
    dirty: bool,
}

pub struct MetadataCache {
    store: Arc<dyn MetadataStore>,
    entries: LruCache<String, CacheEntry>,
    /// Dirty entries evicted while the store was refusing writes.
    parked: BTreeMap<String, MetadataRecord>,
    flush_interval: Duration,
    last_flush: Instant,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn MetadataStore>, max_size: usize, flush_interval: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size)
            .ok_or_else(|| Error::InvalidConfig("cache.max_size must be at least 1".into()))?;
        Ok(Self {
            store,
            entries: LruCache::new(capacity),
            parked: BTreeMap::new(),
            flush_interval,
            last_flush: Instant::now(),
        })
    }

    pub fn from_settings(store: Arc<dyn MetadataStore>, settings: &CacheSettings) -> Result<Self> {
        Self::new(store, settings.max_size, Duration::from_secs(settings.flush_interval_secs))
    }

    pub fn capacity(&self) -> usize { self.entries.cap().get() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Resident keys only; does not touch recency.
    pub fn contains(&self, key: &str) -> bool { self.entries.contains(key) }

    /// Dirty records awaiting a write, parked ones included.
    pub fn dirty_len(&self) -> usize { self.entries.iter().filter(|(_, e)| e.dirty).count() + self.parked.len() }

    pub fn parked_len(&self) -> usize { self.parked.len() }

    /// Return the record for `key`, reading the store on a miss. An absent
    /// record comes back empty and is cached like any other.
    pub fn get(&mut self, key: &str) -> Result<MetadataRecord> {
        if let Some(record) = self.parked.get(key) {
            return Ok(record.clone());
        }
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.record.clone());
        }
        let record = self.store.get_metadata(key)?.unwrap_or_default();
        tracing::debug!(key, "metadata cache miss");
        self.insert(key.to_string(), CacheEntry { record: record.clone(), dirty: false });
        Ok(record)
    }

    /// Store `value` locally and mark it dirty. May evict the LRU entry and,
    /// once the flush interval has elapsed, flush everything dirty.
    pub fn set(&mut self, key: &str, value: MetadataRecord) {
        self.parked.remove(key);
        self.insert(key.to_string(), CacheEntry { record: value, dirty: true });
        if self.last_flush.elapsed() >= self.flush_interval {
            // failures are logged by flush and retried on the next one
            let _ = self.flush();
        }
    }

    /// Read-modify-write of one record.
    pub fn update<F>(&mut self, key: &str, f: F) -> Result<MetadataRecord>
    where
        F: FnOnce(&mut MetadataRecord),
    {
        let mut record = self.get(key)?;
        f(&mut record);
        self.set(key, record.clone());
        Ok(record)
    }

    /// Write every dirty record in one bulk call. On failure nothing is
    /// cleared and the error is returned.
    pub fn flush(&mut self) -> Result<()> {
        let mut updates: BTreeMap<String, MetadataRecord> = self.parked.clone();
        for (key, entry) in self.entries.iter().filter(|(_, e)| e.dirty) {
            updates.insert(key.clone(), entry.record.clone());
        }
        if updates.is_empty() {
            return Ok(());
        }
        match self.store.bulk_upsert_metadata(&updates) {
            Ok(()) => {
                for key in updates.keys() {
                    if let Some(entry) = self.entries.peek_mut(key) {
                        entry.dirty = false;
                    }
                }
                self.parked.clear();
                self.last_flush = Instant::now();
                tracing::info!(keys = updates.len(), "flushed metadata cache");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(keys = updates.len(), error = %e, "metadata flush failed; keeping dirty entries");
                Err(e)
            }
        }
    }

    /// Final flush at the end of a run.
    pub fn finish(&mut self) -> Result<()> { self.flush() }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = entry;
            return;
        }
        if let Some((evicted_key, evicted)) = self.entries.push(key, entry) {
            self.on_evict(evicted_key, evicted);
        }
    }

    fn on_evict(&mut self, key: String, entry: CacheEntry) {
        if !entry.dirty {
            return;
        }
        let single = BTreeMap::from([(key, entry.record)]);
        match self.store.bulk_upsert_metadata(&single) {
            Ok(()) => tracing::debug!(keys = 1, "wrote evicted metadata entry"),
            Err(e) => {
                tracing::warn!(keys = 1, error = %e, "write of evicted entry failed; parking it");
                self.parked.extend(single);
            }
        }
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        if self.dirty_len() > 0 {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, dirty = self.dirty_len(), "dropping metadata cache with unflushed entries");
            }
        }
    }
}

impl MetadataLookup for MetadataCache {
    fn lookup(&mut self, key: &str) -> Result<MetadataRecord> { self.get(key) }
}

/// A [`MetadataCache`] behind one lock; every call, eviction and flush
/// included, runs while holding it.
#[derive(Clone)]
pub struct SharedMetadataCache {
    inner: Arc<Mutex<MetadataCache>>,
}

impl SharedMetadataCache {
    pub fn new(cache: MetadataCache) -> Self { Self { inner: Arc::new(Mutex::new(cache)) } }

    pub fn get(&self, key: &str) -> Result<MetadataRecord> { self.inner.lock().get(key) }

    pub fn set(&self, key: &str, value: MetadataRecord) { self.inner.lock().set(key, value) }

    pub fn update<F>(&self, key: &str, f: F) -> Result<MetadataRecord>
    where
        F: FnOnce(&mut MetadataRecord),
    {
        self.inner.lock().update(key, f)
    }

    pub fn flush(&self) -> Result<()> { self.inner.lock().flush() }

    pub fn finish(&self) -> Result<()> { self.inner.lock().finish() }

    pub fn len(&self) -> usize { self.inner.lock().len() }

    pub fn is_empty(&self) -> bool { self.inner.lock().is_empty() }

    pub fn dirty_len(&self) -> usize { self.inner.lock().dirty_len() }
}

impl MetadataLookup for SharedMetadataCache {
    fn lookup(&mut self, key: &str) -> Result<MetadataRecord> { self.get(key) }
}

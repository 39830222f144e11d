use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use noio_backend::MemoryBackend;
use noio_cache::{MetadataCache, SharedMetadataCache};
use noio_core::traits::{MetadataLookup, MetadataStore};
use noio_core::types::MetadataRecord;
use noio_core::Error;

const NEVER: Duration = Duration::from_secs(3600);

fn record(frequency: u64) -> MetadataRecord { MetadataRecord { frequency, ..MetadataRecord::default() } }

fn setup(max: usize) -> (Arc<MemoryBackend>, MetadataCache) {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    let cache = MetadataCache::new(store.clone(), max, NEVER).unwrap();
    (store, cache)
}

#[test]
fn repeated_get_reads_store_once() {
    let (store, mut cache) = setup(4);
    assert!(cache.get("k").unwrap().is_empty());
    assert!(cache.get("k").unwrap().is_empty());
    assert_eq!(store.reads(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.dirty_len(), 0, "a miss is cached clean");
}

#[test]
fn get_returns_stored_record() {
    let (store, mut cache) = setup(4);
    let mut batch = BTreeMap::new();
    batch.insert("k".to_string(), MetadataRecord { boilerplate_score: Some(0.4), ..record(7) });
    store.bulk_upsert_metadata(&batch).unwrap();
    let got = cache.get("k").unwrap();
    assert_eq!(got.frequency, 7);
    assert_eq!(got.boilerplate_score, Some(0.4));
}

#[test]
fn overflow_writes_exactly_the_evicted_key() {
    let (store, mut cache) = setup(3);
    for i in 0..4 {
        cache.set(&format!("k{i}"), record(i));
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(store.write_calls(), 1);
    assert_eq!(store.stored_len(), 1);
    assert_eq!(store.stored_metadata("k0"), Some(record(0)));
    assert!(!cache.contains("k0"));
    assert_eq!(cache.dirty_len(), 3);
}

#[test]
fn recency_decides_the_victim() {
    let (store, mut cache) = setup(2);
    cache.set("a", record(1));
    cache.set("b", record(2));
    cache.get("a").unwrap();
    cache.set("c", record(3));
    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert_eq!(store.stored_metadata("b"), Some(record(2)));
}

#[test]
fn clean_eviction_does_not_write() {
    let (store, mut cache) = setup(1);
    cache.get("a").unwrap();
    cache.get("b").unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(store.write_calls(), 0);
}

#[test]
fn failed_flush_keeps_dirty_state_until_retry() {
    let (store, mut cache) = setup(8);
    cache.set("a", record(1));
    cache.set("b", record(2));
    store.fail_next_writes(1);
    assert!(matches!(cache.flush(), Err(Error::BackendWrite { keys: 2, .. })));
    assert_eq!(cache.dirty_len(), 2);
    assert_eq!(store.stored_len(), 0);

    cache.flush().unwrap();
    assert_eq!(cache.dirty_len(), 0);
    assert_eq!(store.stored_metadata("a"), Some(record(1)));
    assert_eq!(store.stored_metadata("b"), Some(record(2)));
}

#[test]
fn failed_eviction_write_parks_entry_for_next_flush() {
    let (store, mut cache) = setup(1);
    cache.set("a", record(1));
    store.fail_next_writes(1);
    cache.set("b", record(2));
    assert_eq!(cache.len(), 1, "capacity holds even when the eviction write fails");
    assert_eq!(cache.parked_len(), 1);
    assert_eq!(cache.dirty_len(), 2);

    let reads = store.reads();
    assert_eq!(cache.get("a").unwrap(), record(1), "parked value is served without a read");
    assert_eq!(store.reads(), reads);

    cache.finish().unwrap();
    assert_eq!(cache.dirty_len(), 0);
    assert_eq!(store.stored_metadata("a"), Some(record(1)));
    assert_eq!(store.stored_metadata("b"), Some(record(2)));
}

#[test]
fn elapsed_interval_triggers_flush_on_set() {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    let mut cache = MetadataCache::new(store.clone(), 8, Duration::ZERO).unwrap();
    cache.set("a", record(5));
    assert_eq!(store.stored_metadata("a"), Some(record(5)));
    assert_eq!(cache.dirty_len(), 0);
}

#[test]
fn update_counts_frequency() {
    let (store, mut cache) = setup(4);
    for _ in 0..3 {
        cache.update("s", |r| { r.bump_frequency(); }).unwrap();
    }
    assert_eq!(cache.get("s").unwrap().frequency, 3);
    assert_eq!(store.reads(), 1);
    cache.finish().unwrap();
    assert_eq!(store.stored_metadata("s").map(|r| r.frequency), Some(3));
}

#[test]
fn drop_flushes_remaining_dirty_entries() {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    {
        let mut cache = MetadataCache::new(store.clone(), 4, NEVER).unwrap();
        cache.set("a", record(9));
    }
    assert_eq!(store.stored_metadata("a"), Some(record(9)));
}

#[test]
fn zero_capacity_is_rejected() {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    assert!(matches!(MetadataCache::new(store, 0, NEVER), Err(Error::InvalidConfig(_))));
}

#[test]
fn read_failures_surface_and_cache_nothing() {
    struct Unreachable;
    impl MetadataStore for Unreachable {
        fn get_metadata(&self, key: &str) -> noio_core::Result<Option<MetadataRecord>> {
            Err(Error::BackendRead { key: key.to_string(), message: "connection refused".into() })
        }
        fn bulk_upsert_metadata(&self, _records: &BTreeMap<String, MetadataRecord>) -> noio_core::Result<()> { Ok(()) }
    }
    let mut cache = MetadataCache::new(Arc::new(Unreachable), 4, NEVER).unwrap();
    assert!(matches!(cache.get("k"), Err(Error::BackendRead { .. })));
    assert!(cache.is_empty());
}

#[test]
fn shared_cache_serializes_concurrent_updates() {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    let shared = SharedMetadataCache::new(MetadataCache::new(store.clone(), 16, NEVER).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = shared.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    cache.update("common", |r| { r.bump_frequency(); }).unwrap();
                    cache.set(&format!("t{t}-{i}"), record(i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(shared.len() <= 16);
    shared.finish().unwrap();
    assert_eq!(shared.dirty_len(), 0);
    assert_eq!(shared.get("common").unwrap().frequency, 400);
    assert_eq!(store.stored_metadata("t7-49"), Some(record(49)));
}

#[test]
fn shared_cache_backs_lookups() {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    let mut shared = SharedMetadataCache::new(MetadataCache::new(store, 4, NEVER).unwrap());
    shared.set("k", record(2));
    assert_eq!(shared.lookup("k").unwrap().frequency, 2);
}

proptest! {
    #[test]
    fn size_bound_and_last_write_wins(ops in prop::collection::vec((0u8..12, 0u64..100, any::<bool>()), 1..80), max in 1usize..6) {
        let (store, mut cache) = setup(max);
        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        for (k, v, is_set) in ops {
            let key = format!("k{k}");
            if is_set {
                cache.set(&key, record(v));
                expected.insert(key, v);
            } else {
                let got = cache.get(&key).unwrap();
                prop_assert_eq!(got.frequency, expected.get(&key).copied().unwrap_or(0));
            }
            prop_assert!(cache.len() <= max);
        }
        cache.finish().unwrap();
        for (key, v) in expected {
            prop_assert_eq!(store.stored_metadata(&key).map(|r| r.frequency), Some(v));
        }
    }
}

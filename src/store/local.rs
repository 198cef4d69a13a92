//! Single-node implementation of the distributed store contract.
//!
//! Every key lives on this node, so this node is authoritative for all of
//! them. Misses are loaded through the group's loader with single-flight
//! deduplication, entries honour their expiry, and each group is held to its
//! byte budget by evicting the least recently accessed entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{CacheGroup, DistributedStore, GroupStats, Loader, StoreError};
use crate::clock::{Clock, SystemClock};

type LoadFuture = Shared<BoxFuture<'static, Result<Vec<u8>, StoreError>>>;

/// An in-process store hosting any number of cache groups.
#[derive(Debug)]
pub struct LocalStore {
    /// Identity of this node in log output.
    node_id: Uuid,
    clock: Arc<dyn Clock>,
    groups: DashMap<String, Arc<LocalGroup>>,
}

impl LocalStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose expiry checks use `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            clock,
            groups: DashMap::new(),
        }
    }

    /// Get our node ID.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Names of the registered groups.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributedStore for LocalStore {
    fn new_group(
        &self,
        name: &str,
        capacity_bytes: u64,
        loader: Arc<dyn Loader>,
    ) -> Result<Arc<dyn CacheGroup>, StoreError> {
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateGroup(name.to_string())),
            Entry::Vacant(slot) => {
                let group = Arc::new(LocalGroup::new(
                    name,
                    capacity_bytes,
                    loader,
                    self.clock.clone(),
                ));
                slot.insert(group.clone());

                info!(
                    node_id = %self.node_id,
                    group = %name,
                    capacity_bytes = capacity_bytes,
                    "Registered cache group"
                );

                Ok(group as Arc<dyn CacheGroup>)
            }
        }
    }
}

/// A cached value with its expiry and recency tick.
#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expire_at: DateTime<Utc>,
    last_access: u64,
}

/// The entry table of one group. Only ever touched under its mutex.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Slot>,
    bytes: u64,
    tick: u64,
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl Entries {
    /// Return a live value, dropping it instead if it has expired.
    fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let expired = self.map.get(key)?.expire_at <= now;
        if expired {
            self.take(key);
            return None;
        }

        self.tick += 1;
        let tick = self.tick;
        let slot = self.map.get_mut(key)?;
        slot.last_access = tick;
        Some(slot.value.clone())
    }

    /// Store a value, then evict until the budget holds. Returns evictions.
    fn insert(
        &mut self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
        capacity_bytes: u64,
    ) -> u64 {
        self.take(key);

        self.tick += 1;
        self.bytes += entry_size(key, &value);
        self.map.insert(
            key.to_string(),
            Slot {
                value,
                expire_at,
                last_access: self.tick,
            },
        );

        let mut evicted = 0;
        while self.bytes > capacity_bytes {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.take(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn take(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(slot) => {
                self.bytes -= entry_size(key, &slot.value);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_errors: AtomicU64,
    sets: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One namespace of a [`LocalStore`].
pub struct LocalGroup {
    name: String,
    capacity_bytes: u64,
    loader: Arc<dyn Loader>,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<Entries>>,
    /// Loads in progress, shared by every caller missing the same key.
    inflight: DashMap<String, LoadFuture>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("name", &self.name)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl LocalGroup {
    fn new(
        name: &str,
        capacity_bytes: u64,
        loader: Arc<dyn Loader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.to_string(),
            capacity_bytes,
            loader,
            clock,
            entries: Arc::new(Mutex::new(Entries::default())),
            inflight: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Join the load in progress for `key`, starting one if there is none.
    fn flight(&self, key: &str) -> LoadFuture {
        self.inflight
            .entry(key.to_string())
            .or_insert_with(|| self.start_load(key))
            .value()
            .clone()
    }

    fn start_load(&self, key: &str) -> LoadFuture {
        let key = key.to_string();
        let group = self.name.clone();
        let capacity_bytes = self.capacity_bytes;
        let loader = self.loader.clone();
        let clock = self.clock.clone();
        let entries = self.entries.clone();
        let counters = self.counters.clone();

        async move {
            // A previous flight may have filled the key since our miss.
            let cached = entries.lock().lookup(&key, clock.now());
            if let Some(value) = cached {
                return Ok(value);
            }

            Counters::bump(&counters.loads);
            trace!(group = %group, key = %key, "Loading missing key");

            match loader.load(&key).await {
                Ok((value, expire_at)) => {
                    let evicted =
                        entries
                            .lock()
                            .insert(&key, value.clone(), expire_at, capacity_bytes);
                    counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                    Ok(value)
                }
                Err(err) => {
                    Counters::bump(&counters.load_errors);
                    debug!(group = %group, key = %key, error = %err, "Load failed");
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl CacheGroup for LocalGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        Counters::bump(&self.counters.gets);

        let cached = self.entries.lock().lookup(key, self.clock.now());
        if let Some(value) = cached {
            Counters::bump(&self.counters.hits);
            return Ok(value);
        }
        Counters::bump(&self.counters.misses);

        let flight = self.flight(key);
        let result = flight.clone().await;
        self.inflight
            .remove_if(key, |_, current| current.ptr_eq(&flight));
        result
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
        _hot: bool,
    ) -> Result<(), StoreError> {
        Counters::bump(&self.counters.sets);
        let evicted = self
            .entries
            .lock()
            .insert(key, value, expire_at, self.capacity_bytes);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(group = %self.name, evicted = evicted, "Evicted entries over capacity");
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        Counters::bump(&self.counters.removes);
        self.entries.lock().take(key);
        Ok(())
    }

    fn stats(&self) -> GroupStats {
        let (items, bytes) = {
            let entries = self.entries.lock();
            (entries.map.len() as u64, entries.bytes)
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        GroupStats {
            name: self.name.clone(),
            items,
            bytes,
            capacity_bytes: self.capacity_bytes,
            gets: load(&self.counters.gets),
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            loads: load(&self.counters.loads),
            load_errors: load(&self.counters.load_errors),
            sets: load(&self.counters.sets),
            removes: load(&self.counters.removes),
            evictions: load(&self.counters.evictions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// Loader returning "<key>#<call number>" and counting its calls.
    struct CountingLoader {
        calls: AtomicU64,
        clock: ManualClock,
        ttl: chrono::TimeDelta,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingLoader {
        fn new(clock: ManualClock) -> Arc<Self> {
            Self::with_delay(clock, Duration::ZERO)
        }

        fn with_delay(clock: ManualClock, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                clock,
                ttl: chrono::TimeDelta::seconds(1),
                delay,
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &str) -> Result<(Vec<u8>, DateTime<Utc>), StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Load {
                    key: key.to_string(),
                    reason: "backend down".to_string(),
                });
            }
            Ok((
                format!("{}#{}", key, n).into_bytes(),
                self.clock.now() + self.ttl,
            ))
        }
    }

    fn test_store(clock: &ManualClock) -> LocalStore {
        LocalStore::with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_miss_loads_then_hits() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::new(clock.clone());
        let group = store.new_group("g", 1024, loader.clone()).unwrap();

        assert_eq!(group.get("k").await.unwrap(), b"k#1".to_vec());
        assert_eq!(group.get("k").await.unwrap(), b"k#1".to_vec());
        assert_eq!(loader.calls(), 1);

        let stats = group.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.items, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::with_delay(clock.clone(), Duration::from_millis(20));
        let group = store.new_group("g", 1024, loader.clone()).unwrap();

        let gets = (0..8).map(|_| group.get("shared"));
        let results = futures::future::join_all(gets).await;

        assert_eq!(loader.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), b"shared#1".to_vec());
        }
        assert_eq!(group.stats().loads, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_reloaded() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::new(clock.clone());
        let group = store.new_group("g", 1024, loader.clone()).unwrap();

        group.get("k").await.unwrap();
        clock.advance(Duration::from_secs(1));

        assert_eq!(group.get("k").await.unwrap(), b"k#2".to_vec());
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_remove_forces_reload() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::new(clock.clone());
        let group = store.new_group("g", 1024, loader.clone()).unwrap();

        group.get("k").await.unwrap();
        let expire_at = clock.now() + chrono::TimeDelta::seconds(5);
        assert_ok!(group.set("k", b"fresh".to_vec(), expire_at, false).await);
        assert_eq!(group.get("k").await.unwrap(), b"fresh".to_vec());

        assert_ok!(group.remove("k").await);
        assert_ok!(group.remove("never-stored").await);
        assert_eq!(group.get("k").await.unwrap(), b"k#2".to_vec());

        let stats = group.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.removes, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::new(clock.clone());
        // Each entry below costs 1 byte of key + 4 bytes of value.
        let group = store.new_group("g", 10, loader.clone()).unwrap();
        let expire_at = clock.now() + chrono::TimeDelta::seconds(60);

        group.set("a", b"aaaa".to_vec(), expire_at, false).await.unwrap();
        group.set("b", b"bbbb".to_vec(), expire_at, false).await.unwrap();
        assert_eq!(group.get("a").await.unwrap(), b"aaaa".to_vec());
        group.set("c", b"cccc".to_vec(), expire_at, false).await.unwrap();

        let stats = group.stats();
        assert_eq!(stats.items, 2);
        assert_eq!(stats.bytes, 10);
        assert_eq!(stats.evictions, 1);

        // "b" was the least recently touched, so it went and must reload.
        assert_eq!(group.get("b").await.unwrap(), b"b#1".to_vec());
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_not_retained() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let group = store
            .new_group("g", 4, CountingLoader::new(clock.clone()))
            .unwrap();
        let expire_at = clock.now() + chrono::TimeDelta::seconds(60);

        group.set("big", b"0123456789".to_vec(), expire_at, false).await.unwrap();

        let stats = group.stats();
        assert_eq!(stats.items, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let clock = ManualClock::default();
        let store = test_store(&clock);
        let loader = CountingLoader::new(clock.clone());
        let group = store.new_group("g", 1024, loader.clone()).unwrap();

        loader.fail.store(true, Ordering::SeqCst);
        let err = assert_err!(group.get("k").await);
        assert!(matches!(err, StoreError::Load { .. }));

        loader.fail.store(false, Ordering::SeqCst);
        assert_eq!(group.get("k").await.unwrap(), b"k#2".to_vec());
        assert_eq!(group.stats().load_errors, 1);
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let clock = ManualClock::default();
        let store = test_store(&clock);

        store
            .new_group("rate-limit", 1024, CountingLoader::new(clock.clone()))
            .unwrap();
        let err = store
            .new_group("rate-limit", 1024, CountingLoader::new(clock.clone()))
            .unwrap_err();

        assert_eq!(err, StoreError::DuplicateGroup("rate-limit".to_string()));
        assert_eq!(store.group_names(), vec!["rate-limit".to_string()]);
    }
}

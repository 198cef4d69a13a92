//! Distributed store contract used by the rate limiter.
//!
//! The limiter keeps its counters in a key-sharded cache where every key has
//! exactly one authoritative node. Peer discovery, key routing and the
//! transport between nodes belong to the store; this module only describes
//! the operations the limiter needs from it. [`LocalStore`] is a single-node
//! implementation of the same contract.

mod local;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use local::LocalStore;

/// Errors reported by a distributed store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Group already registered: {0}")]
    DuplicateGroup(String),
    #[error("Loader failed for key '{key}': {reason}")]
    Load { key: String, reason: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Produces the initial value for a key nobody in the cluster holds.
///
/// The store calls this at most once per cluster-wide miss; concurrent misses
/// for the same key share the result.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Build the bytes to cache for `key` together with their expiry.
    async fn load(&self, key: &str) -> Result<(Vec<u8>, DateTime<Utc>), StoreError>;
}

/// A store capable of hosting named cache groups.
pub trait DistributedStore: Send + Sync + std::fmt::Debug {
    /// Register a group with its loader and byte budget.
    fn new_group(
        &self,
        name: &str,
        capacity_bytes: u64,
        loader: Arc<dyn Loader>,
    ) -> Result<Arc<dyn CacheGroup>, StoreError>;
}

/// One namespace inside a distributed store.
///
/// No operation is atomic with respect to another: there is no increment,
/// no compare-and-swap and no transactional get+set.
#[async_trait]
pub trait CacheGroup: Send + Sync + std::fmt::Debug {
    /// The group (namespace) name.
    fn name(&self) -> &str;

    /// Fetch the bytes for `key`, running the group's loader on a miss.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Overwrite the value and expiry for `key`.
    ///
    /// `hot` asks the store to also keep a copy in its hot tier.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
        hot: bool,
    ) -> Result<(), StoreError>;

    /// Evict `key` everywhere. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Snapshot of the group's statistics.
    fn stats(&self) -> GroupStats;
}

/// Statistics a cache group exposes to metrics exporters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    pub name: String,
    pub items: u64,
    pub bytes: u64,
    pub capacity_bytes: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_errors: u64,
    pub sets: u64,
    pub removes: u64,
    pub evictions: u64,
}

//! Core rate limiter implementation.
//!
//! Counters live in a distributed store that only offers get, set and
//! remove. Each `consume` reads the key's counter (the store runs our loader
//! on a cluster-wide miss), increments it locally and writes it back. The
//! read-modify-write is not atomic: concurrent callers on the same key can
//! overwrite each other's increment, so admission may run slightly over
//! quota under contention.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitSettings;
use crate::error::{HivelimitError, Result};
use crate::store::{CacheGroup, DistributedStore, Loader, StoreError};

use super::counter::{CounterEncoding, WindowCounter};
use super::expiry::ExpiryTable;
use super::metrics::MetricsExporter;

/// Cache group name used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "rate-limit";
/// Cache group byte budget used when none is configured.
pub const DEFAULT_CAPACITY_BYTES: u64 = 10_000_000;

/// Configuration for a rate limiter.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Window length
    pub interval: Duration,
    /// Accepted consumptions per window
    pub slots: u64,
    /// Store holding the counters; construction fails without one
    pub store: Option<Arc<dyn DistributedStore>>,
    /// Cache group name, `rate-limit` if empty
    pub namespace: String,
    /// Cache group byte budget, 10MB if zero
    pub capacity_bytes: u64,
    /// Remove the key before writing the updated counter back
    pub remove_before_reinsert: bool,
    /// Write counters back even once their window has expired
    pub reinsert_expired: bool,
    /// Counter layout in the store
    pub encoding: CounterEncoding,
    /// Deadline for each store round-trip
    pub operation_timeout: Option<Duration>,
    /// Time source for window expiry
    pub clock: Arc<dyn Clock>,
}

impl LimiterConfig {
    /// Configuration with default namespace, capacity and behaviour.
    pub fn new(interval: Duration, slots: u64, store: Arc<dyn DistributedStore>) -> Self {
        Self {
            interval,
            slots,
            store: Some(store),
            namespace: DEFAULT_NAMESPACE.to_string(),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            remove_before_reinsert: true,
            reinsert_expired: false,
            encoding: CounterEncoding::default(),
            operation_timeout: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Build from file/environment settings.
    pub fn from_settings(settings: &RateLimitSettings, store: Arc<dyn DistributedStore>) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            slots: settings.slots,
            store: Some(store),
            namespace: settings.namespace.clone(),
            capacity_bytes: settings.capacity_bytes,
            remove_before_reinsert: settings.remove_before_reinsert,
            reinsert_expired: settings.reinsert_expired,
            encoding: settings.encoding,
            operation_timeout: settings.operation_timeout_ms.map(Duration::from_millis),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_capacity_bytes(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_remove_before_reinsert(mut self, enabled: bool) -> Self {
        self.remove_before_reinsert = enabled;
        self
    }

    pub fn with_reinsert_expired(mut self, enabled: bool) -> Self {
        self.reinsert_expired = enabled;
        self
    }

    pub fn with_encoding(mut self, encoding: CounterEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Outcome of a single consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request is allowed
    pub accepted: bool,
    /// Counter value after this consumption
    pub count: u64,
    /// Configured slots per window
    pub slots: u64,
    /// Whether the counter's window had already ended
    pub expired: bool,
    /// End of the counter's window
    pub expire_at: DateTime<Utc>,
}

impl Verdict {
    /// Slots left in the window after this consumption.
    pub fn remaining(&self) -> u64 {
        if self.expired {
            return 0;
        }
        self.slots.saturating_sub(self.count)
    }
}

/// Opens a window for a key nobody in the cluster is counting yet.
struct WindowLoader {
    interval: TimeDelta,
    encoding: CounterEncoding,
    clock: Arc<dyn Clock>,
    expiries: Arc<ExpiryTable>,
}

#[async_trait]
impl Loader for WindowLoader {
    async fn load(&self, key: &str) -> std::result::Result<(Vec<u8>, DateTime<Utc>), StoreError> {
        let now = self.clock.now();
        let expire_at = now
            .checked_add_signed(self.interval)
            .ok_or_else(|| StoreError::Load {
                key: key.to_string(),
                reason: "window expiry out of range".to_string(),
            })?;
        let counter = WindowCounter::fresh(expire_at);
        let data = self.encoding.encode(&counter).map_err(|e| StoreError::Load {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        self.expiries.record(key, counter.expire_at, now);

        trace!(key = %key, expire_at = %counter.expire_at, "Opened rate limit window");

        Ok((data, counter.expire_at))
    }
}

/// A fixed-window rate limiter keeping its counters in a distributed store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    slots: u64,
    remove_before_reinsert: bool,
    reinsert_expired: bool,
    encoding: CounterEncoding,
    operation_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    /// Window expiries opened or observed by this limiter
    expiries: Arc<ExpiryTable>,
    group: Arc<dyn CacheGroup>,
}

impl RateLimiter {
    /// Create a rate limiter, registering its cache group with the store.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(HivelimitError::Config(
                "interval must be greater than zero".to_string(),
            ));
        }
        if config.slots == 0 {
            return Err(HivelimitError::Config(
                "slots must be greater than zero".to_string(),
            ));
        }
        let store = config
            .store
            .ok_or_else(|| HivelimitError::Config("store is required".to_string()))?;
        let interval = TimeDelta::from_std(config.interval)
            .map_err(|e| HivelimitError::Config(format!("interval out of range: {}", e)))?;
        if config.clock.now().checked_add_signed(interval).is_none() {
            return Err(HivelimitError::Config(format!(
                "interval {:?} puts the window expiry out of range",
                config.interval
            )));
        }

        let namespace = if config.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            config.namespace
        };
        let capacity_bytes = if config.capacity_bytes == 0 {
            DEFAULT_CAPACITY_BYTES
        } else {
            config.capacity_bytes
        };

        let expiries = Arc::new(ExpiryTable::new(interval));
        let loader = Arc::new(WindowLoader {
            interval,
            encoding: config.encoding,
            clock: config.clock.clone(),
            expiries: expiries.clone(),
        });

        let group = store
            .new_group(&namespace, capacity_bytes, loader)
            .map_err(|e| HivelimitError::Config(e.to_string()))?;

        debug!(
            namespace = %namespace,
            capacity_bytes = capacity_bytes,
            interval = ?config.interval,
            slots = config.slots,
            encoding = ?config.encoding,
            "Created rate limiter"
        );

        Ok(Self {
            interval: config.interval,
            slots: config.slots,
            remove_before_reinsert: config.remove_before_reinsert,
            reinsert_expired: config.reinsert_expired,
            encoding: config.encoding,
            operation_timeout: config.operation_timeout,
            clock: config.clock,
            expiries,
            group,
        })
    }

    /// Consume one slot for `key`.
    ///
    /// Returns `Ok(true)` if the request is allowed and `Ok(false)` if the
    /// key has used up its slots for the current window. An error means the
    /// limiter could not decide; the caller chooses whether to fail open or
    /// closed.
    pub async fn consume(&self, key: &str) -> Result<bool> {
        self.consume_verdict(key).await.map(|v| v.accepted)
    }

    /// Like [`consume`](Self::consume), giving up with
    /// [`HivelimitError::Cancelled`] as soon as `signal` resolves.
    pub async fn consume_until<F>(&self, key: &str, signal: F) -> Result<bool>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            biased;
            _ = signal => Err(HivelimitError::Cancelled),
            verdict = self.consume_verdict(key) => verdict.map(|v| v.accepted),
        }
    }

    /// Consume one slot for `key` and report the full decision.
    pub async fn consume_verdict(&self, key: &str) -> Result<Verdict> {
        if key.is_empty() {
            return Err(HivelimitError::EmptyKey);
        }

        let data = self.bounded("get", self.group.get(key)).await?;
        let decoded = self.encoding.decode(&data)?;

        let now = self.clock.now();
        let counter = WindowCounter {
            value: decoded.value.saturating_add(1),
            expire_at: self.window_expiry(key, decoded.expire_at, now),
        };
        let WindowCounter { value: count, expire_at } = counter;
        let expired = counter.is_expired(now);

        if self.remove_before_reinsert {
            if let Err(e) = self.bounded("remove", self.group.remove(key)).await {
                warn!(key = %key, error = %e, "Failed to remove counter before reinsert");
            }
        }

        if self.reinsert_expired || !expired {
            let data = self.encoding.encode(&counter)?;
            self.bounded("set", self.group.set(key, data, expire_at, false))
                .await?;
        }

        let accepted = !expired && count <= self.slots;

        debug!(
            key = %key,
            count = count,
            slots = self.slots,
            remaining = ?(expire_at - now).to_std().unwrap_or_default(),
            interval = ?self.interval,
            expired = expired,
            accepted = accepted,
            "Rate limit decision"
        );

        Ok(Verdict {
            accepted,
            count,
            slots: self.slots,
            expired,
            expire_at,
        })
    }

    /// Resolve the end of the current window for `key`.
    ///
    /// With the record encoding the stored expiry wins and is memoised in the
    /// local table. With the value encoding the local table is the only
    /// source, and the loader must already have filled it.
    fn window_expiry(
        &self,
        key: &str,
        stored: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if let Some(expire_at) = stored {
            if self.expiries.lookup(key) != Some(expire_at) {
                self.expiries.record(key, expire_at, now);
            }
            return expire_at;
        }

        match self.expiries.lookup(key) {
            Some(expire_at) => expire_at,
            None => panic!(
                "no window expiry recorded for key '{}': the loader never ran on this node",
                key
            ),
        }
    }

    /// Run a store call under the configured operation timeout.
    async fn bounded<T, F>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match self.operation_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| HivelimitError::Timeout { op, after })?
                .map_err(HivelimitError::from),
            None => call.await.map_err(HivelimitError::from),
        }
    }

    /// Handle for exporting the backing cache group's statistics.
    pub fn metrics_exporter(&self) -> MetricsExporter {
        MetricsExporter::new(self.group.clone())
    }

    /// Number of keys with a window expiry known to this limiter.
    pub fn tracked_keys(&self) -> usize {
        self.expiries.len()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    /// The cache group name in use.
    pub fn namespace(&self) -> &str {
        self.group.name()
    }
}

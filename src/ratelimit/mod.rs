//! Fixed-window rate limiting on top of a distributed store.

mod counter;
mod expiry;
mod limiter;
mod metrics;

pub use counter::{CounterEncoding, DecodedCounter, WindowCounter};
pub use expiry::ExpiryTable;
pub use limiter::{LimiterConfig, RateLimiter, Verdict, DEFAULT_CAPACITY_BYTES, DEFAULT_NAMESPACE};
pub use metrics::MetricsExporter;

//! Hivelimit - Fixed-Window Rate Limiting over a Distributed Cache
//!
//! This crate implements a fixed-window rate limiter whose counters live in a
//! peer-sharded cache rather than a central database. The cache only offers
//! get, set and remove, so each decision is a read-modify-write against the
//! key's authoritative node.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{HivelimitError, Result};
pub use ratelimit::{LimiterConfig, RateLimiter, Verdict};

//! Configuration management for Hivelimit.

use serde::{Deserialize, Serialize};

use crate::error::{HivelimitError, Result};
use crate::ratelimit::CounterEncoding;

/// Environment variable prefix for layered configuration.
const ENV_PREFIX: &str = "HIVELIMIT";

/// Main configuration for Hivelimit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HivelimitConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Window length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Accepted consumptions per window
    #[serde(default = "default_slots")]
    pub slots: u64,

    /// Cache group name inside the store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Byte budget for the cache group
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,

    /// Remove the key before writing the updated counter back
    #[serde(default = "default_remove_before_reinsert")]
    pub remove_before_reinsert: bool,

    /// Write counters back even once their window has expired
    #[serde(default)]
    pub reinsert_expired: bool,

    /// Counter layout in the store
    #[serde(default)]
    pub encoding: CounterEncoding,

    /// Deadline for each store round-trip in milliseconds
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            slots: default_slots(),
            namespace: default_namespace(),
            capacity_bytes: default_capacity_bytes(),
            remove_before_reinsert: default_remove_before_reinsert(),
            reinsert_expired: false,
            encoding: CounterEncoding::default(),
            operation_timeout_ms: None,
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_slots() -> u64 {
    5
}

fn default_namespace() -> String {
    crate::ratelimit::DEFAULT_NAMESPACE.to_string()
}

fn default_capacity_bytes() -> u64 {
    crate::ratelimit::DEFAULT_CAPACITY_BYTES
}

fn default_remove_before_reinsert() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl HivelimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: HivelimitConfig = serde_yaml::from_str(&contents)
            .map_err(|e| HivelimitError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under the environment.
    ///
    /// Environment variables use the `HIVELIMIT_` prefix and `__` between
    /// nesting levels, e.g. `HIVELIMIT_RATE_LIMITING__SLOTS=10`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HivelimitError::Config(e.to_string()))
    }
}

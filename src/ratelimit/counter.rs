//! Window counter and its byte encodings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HivelimitError, Result};

/// The state a key maps to for one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    /// Consumptions recorded in the current window
    pub value: u64,
    /// When the current window ends
    #[serde(rename = "expire")]
    pub expire_at: DateTime<Utc>,
}

impl WindowCounter {
    /// A counter with no consumptions, for a window ending at `expire_at`.
    pub fn fresh(expire_at: DateTime<Utc>) -> Self {
        Self {
            value: 0,
            expire_at,
        }
    }

    /// Whether the window is over at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }
}

/// A counter as read back from the store.
///
/// The expiry is only present when the encoding carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCounter {
    pub value: u64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// How counters are laid out in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterEncoding {
    /// JSON record carrying both value and expiry: `{"value":3,"expire":"..."}`.
    ///
    /// The stored expiry is authoritative, so any node can serve a key whose
    /// window was opened elsewhere.
    #[default]
    Record,
    /// ASCII decimal of the value only.
    ///
    /// The expiry lives solely in the limiter's local expiry table, which
    /// therefore must have seen the window open.
    Value,
}

impl CounterEncoding {
    /// Encode a counter for the store.
    pub fn encode(&self, counter: &WindowCounter) -> Result<Vec<u8>> {
        match self {
            CounterEncoding::Record => serde_json::to_vec(counter)
                .map_err(|e| HivelimitError::Encoding(e.to_string())),
            CounterEncoding::Value => Ok(counter.value.to_string().into_bytes()),
        }
    }

    /// Decode counter bytes read from the store.
    pub fn decode(&self, data: &[u8]) -> Result<DecodedCounter> {
        match self {
            CounterEncoding::Record => {
                let counter: WindowCounter = serde_json::from_slice(data)
                    .map_err(|e| HivelimitError::Encoding(e.to_string()))?;
                Ok(DecodedCounter {
                    value: counter.value,
                    expire_at: Some(counter.expire_at),
                })
            }
            CounterEncoding::Value => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| HivelimitError::Encoding(e.to_string()))?;
                let value = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| HivelimitError::Encoding(format!("{}: {:?}", e, text)))?;
                Ok(DecodedCounter {
                    value,
                    expire_at: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expiry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap()
    }

    #[test]
    fn test_fresh_counter_is_empty() {
        let counter = WindowCounter::fresh(expiry());
        assert_eq!(counter.value, 0);
        assert_eq!(counter.expire_at, expiry());
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let counter = WindowCounter::fresh(expiry());

        assert!(!counter.is_expired(expiry() - chrono::TimeDelta::milliseconds(1)));
        assert!(counter.is_expired(expiry()));
    }

    #[test]
    fn test_record_encoding_layout() {
        let counter = WindowCounter {
            value: 3,
            expire_at: expiry(),
        };

        let data = CounterEncoding::Record.encode(&counter).unwrap();
        assert_eq!(
            String::from_utf8(data.clone()).unwrap(),
            r#"{"value":3,"expire":"2024-01-01T00:00:10Z"}"#
        );

        let decoded = CounterEncoding::Record.decode(&data).unwrap();
        assert_eq!(decoded.value, 3);
        assert_eq!(decoded.expire_at, Some(expiry()));
    }

    #[test]
    fn test_value_encoding_drops_expiry() {
        let counter = WindowCounter {
            value: 42,
            expire_at: expiry(),
        };

        let data = CounterEncoding::Value.encode(&counter).unwrap();
        assert_eq!(data, b"42".to_vec());

        let decoded = CounterEncoding::Value.decode(&data).unwrap();
        assert_eq!(decoded.value, 42);
        assert_eq!(decoded.expire_at, None);
    }

    #[test]
    fn test_malformed_bytes_are_encoding_errors() {
        assert!(matches!(
            CounterEncoding::Record.decode(b"not json"),
            Err(HivelimitError::Encoding(_))
        ));
        assert!(matches!(
            CounterEncoding::Value.decode(b"-1"),
            Err(HivelimitError::Encoding(_))
        ));
        assert!(matches!(
            CounterEncoding::Value.decode(&[0xff, 0xfe]),
            Err(HivelimitError::Encoding(_))
        ));
    }

    #[test]
    fn test_encoding_names() {
        let parsed: CounterEncoding = serde_yaml::from_str("value").unwrap();
        assert_eq!(parsed, CounterEncoding::Value);
        assert_eq!(CounterEncoding::default(), CounterEncoding::Record);
    }
}

//! Handle for external metrics exporters.

use std::sync::Arc;

use crate::store::{CacheGroup, GroupStats};

/// Read-only view of the cache group backing a rate limiter.
///
/// The limiter computes no statistics of its own; an exporter polls
/// [`MetricsExporter::snapshot`] and renders the group's counters however it
/// likes (`GroupStats` is `Serialize`). The handle keeps the group alive for
/// as long as it is held.
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    group: Arc<dyn CacheGroup>,
}

impl MetricsExporter {
    pub(crate) fn new(group: Arc<dyn CacheGroup>) -> Self {
        Self { group }
    }

    /// Name of the cache group (the limiter's namespace).
    pub fn name(&self) -> &str {
        self.group.name()
    }

    /// Current item count, byte usage and hit/miss/load counters.
    pub fn snapshot(&self) -> GroupStats {
        self.group.stats()
    }
}

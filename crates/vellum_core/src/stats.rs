//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lookup counters for a cache.
///
/// Shared freely; counters are monotonic and only approximately
/// consistent with each other, which is all observability needs.
#[derive(Debug, Default)]
pub struct CacheStats {
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl CacheStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a lookup.
    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a hit.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Total lookups so far.
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Total hits so far.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting() {
        let stats = CacheStats::new();
        stats.record_lookup();
        stats.record_lookup();
        stats.record_hit();
        assert_eq!(stats.lookups(), 2);
        assert_eq!(stats.hits(), 1);
    }
}

//! Store configuration.

use std::time::Duration;

/// Retry policy for lock acquisition races.
///
/// The defaults are preserved from long-running production tuning of the
/// original system rather than re-derived: 10 attempts, starting at 1ms
/// and growing by 50ms per retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub first_delay: Duration,
    /// Added to the sleep on every further attempt.
    pub delay_increment: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            first_delay: Duration::from_millis(1),
            delay_increment: Duration::from_millis(50),
        }
    }
}

impl LockRetryPolicy {
    /// Sleep to apply after the given failed attempt (1-based).
    ///
    /// Delays are monotonically increasing by construction.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.first_delay + self.delay_increment * attempt.saturating_sub(1)
    }
}

/// Configuration for a repository's caches and locking.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the per-session pristine fragment cache.
    pub pristine_cache_size: usize,
    /// Capacity of each selection context's clean-selection cache.
    pub selection_cache_size: usize,
    /// Capacity of a caching mapper's row cache.
    pub row_cache_size: usize,
    /// Capacity of the lock manager's cache.
    pub lock_cache_size: usize,
    /// Whether the repository runs clustered. Disables the lock
    /// manager's cache, since a remote node could change lock state the
    /// cache would not see.
    pub clustered: bool,
    /// Lock acquisition retry policy.
    pub lock_retry: LockRetryPolicy,
    /// Filesystem time resolution slack used by binary GC when comparing
    /// file mtimes against the mark-phase start.
    pub fs_time_resolution: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pristine_cache_size: 8192,
            selection_cache_size: 1024,
            row_cache_size: 16384,
            lock_cache_size: 4096,
            clustered: false,
            lock_retry: LockRetryPolicy::default(),
            fs_time_resolution: Duration::from_millis(2000),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pristine fragment cache capacity.
    #[must_use]
    pub const fn pristine_cache_size(mut self, size: usize) -> Self {
        self.pristine_cache_size = size;
        self
    }

    /// Sets the selection cache capacity.
    #[must_use]
    pub const fn selection_cache_size(mut self, size: usize) -> Self {
        self.selection_cache_size = size;
        self
    }

    /// Sets the row cache capacity.
    #[must_use]
    pub const fn row_cache_size(mut self, size: usize) -> Self {
        self.row_cache_size = size;
        self
    }

    /// Sets the lock cache capacity.
    #[must_use]
    pub const fn lock_cache_size(mut self, size: usize) -> Self {
        self.lock_cache_size = size;
        self
    }

    /// Sets clustered mode.
    #[must_use]
    pub const fn clustered(mut self, clustered: bool) -> Self {
        self.clustered = clustered;
        self
    }

    /// Sets the lock retry policy.
    #[must_use]
    pub fn lock_retry(mut self, policy: LockRetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy() {
        let policy = LockRetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_after(1), Duration::from_millis(1));
        assert_eq!(policy.delay_after(2), Duration::from_millis(51));
        assert_eq!(policy.delay_after(3), Duration::from_millis(101));
    }

    #[test]
    fn delays_increase_monotonically() {
        let policy = LockRetryPolicy::default();
        let mut last = Duration::ZERO;
        for attempt in 1..policy.max_attempts {
            let delay = policy.delay_after(attempt);
            assert!(delay > last);
            last = delay;
        }
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .row_cache_size(64)
            .clustered(true);
        assert_eq!(config.row_cache_size, 64);
        assert!(config.clustered);
    }
}

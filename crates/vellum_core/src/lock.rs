//! Document locking.

use crate::config::LockRetryPolicy;
use crate::lru::LruMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use vellum_mapper::{Lock, RowMapper, StoreError, StoreResult};
use vellum_model::DocId;

/// Cached knowledge about one document's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CachedLock {
    /// The document is locked.
    Present(Lock),
    /// The document is known to be unlocked.
    Absent,
}

/// The document-lock store.
///
/// Lock state must stay correct under races from concurrent threads and
/// cluster nodes, so the design trades throughput for a drastically
/// simpler consistency story: every operation is serialized under one
/// process-wide mutex, which removes any concurrent-access window inside
/// the manager and with it any need for a cache-invalidation protocol.
///
/// Non-clustered repositories layer a bounded LRU in front of the
/// mapper, caching both present locks and confirmed absence. Clustered
/// repositories disable the cache entirely: a remote node can change
/// lock state the local cache would never see.
///
/// Races between nodes inserting the same lock row resolve through the
/// database's unique constraint: the loser sees a retryable conflict
/// and retries with a growing backoff, discovering the winner's lock.
pub struct LockManager {
    /// The lock manager has its own mapper connection, transactionless.
    mapper: Arc<dyn RowMapper>,
    serial: Mutex<()>,
    cache: Option<Mutex<LruMap<DocId, CachedLock>>>,
    policy: LockRetryPolicy,
}

impl LockManager {
    /// Creates a lock manager over its own mapper connection.
    ///
    /// `clustered` disables the local cache. `cache_size` bounds it
    /// otherwise.
    #[must_use]
    pub fn new(
        mapper: Arc<dyn RowMapper>,
        clustered: bool,
        cache_size: usize,
        policy: LockRetryPolicy,
    ) -> Self {
        Self {
            mapper,
            serial: Mutex::new(()),
            cache: (!clustered).then(|| Mutex::new(LruMap::new(cache_size))),
            policy,
        }
    }

    /// Whether an unlock by `owner` may remove `lock`.
    ///
    /// A `None` owner removes unconditionally; otherwise the owner must
    /// equal the lock's recorded owner.
    #[must_use]
    pub fn can_lock_be_removed(lock: &Lock, owner: Option<&str>) -> bool {
        match owner {
            None => true,
            Some(owner) => owner == lock.owner,
        }
    }

    fn cache_get(&self, id: DocId) -> Option<CachedLock> {
        self.cache.as_ref()?.lock().get(&id).cloned()
    }

    fn cache_put(&self, id: DocId, entry: CachedLock) {
        if let Some(cache) = &self.cache {
            cache.lock().insert(id, entry);
        }
    }

    /// Reads the lock on a document, `None` when unlocked.
    pub fn get_lock(&self, id: DocId) -> StoreResult<Option<Lock>> {
        let _serial = self.serial.lock();
        if let Some(cached) = self.cache_get(id) {
            return Ok(match cached {
                CachedLock::Present(lock) => Some(lock),
                CachedLock::Absent => None,
            });
        }
        let lock = self.mapper.get_lock(id)?;
        self.cache_put(
            id,
            match &lock {
                Some(lock) => CachedLock::Present(lock.clone()),
                None => CachedLock::Absent,
            },
        );
        Ok(lock)
    }

    /// Locks a document for `owner`.
    ///
    /// Returns the pre-existing lock without taking it over when the
    /// document is already locked, `None` on success.
    ///
    /// A conflicting insert from another node is retried up to the
    /// policy's bound with linearly growing sleeps; exhaustion raises
    /// [`StoreError::TooManyConcurrentUpdates`] rather than the final
    /// underlying conflict, whose precise cause is not informative to
    /// the caller.
    pub fn set_lock(&self, id: DocId, owner: &str) -> StoreResult<Option<Lock>> {
        let lock = Lock::new(owner, now_millis());
        let mut attempt = 1;
        loop {
            match self.try_set_lock(id, &lock) {
                Ok(old) => return Ok(old),
                Err(error) if error.is_concurrency() => {
                    if attempt >= self.policy.max_attempts {
                        return Err(StoreError::TooManyConcurrentUpdates { attempts: attempt });
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(%id, %attempt, ?delay, "lock conflict, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn try_set_lock(&self, id: DocId, lock: &Lock) -> StoreResult<Option<Lock>> {
        let _serial = self.serial.lock();
        let old = self.mapper.set_lock(id, lock)?;
        match &old {
            Some(existing) => self.cache_put(id, CachedLock::Present(existing.clone())),
            None => self.cache_put(id, CachedLock::Present(lock.clone())),
        }
        Ok(old)
    }

    /// Unlocks a document.
    ///
    /// With an owner, the removal only succeeds when the owner matches;
    /// a mismatch leaves the lock in place and returns it flagged
    /// failed. Returns `None` when the document was not locked.
    pub fn remove_lock(&self, id: DocId, owner: Option<&str>) -> StoreResult<Option<Lock>> {
        let _serial = self.serial.lock();
        let Some(existing) = self.mapper.get_lock(id)? else {
            self.cache_put(id, CachedLock::Absent);
            return Ok(None);
        };
        if !Self::can_lock_be_removed(&existing, owner) {
            self.cache_put(id, CachedLock::Present(existing.clone()));
            return Ok(Some(existing.as_failed()));
        }
        self.mapper.remove_lock(id)?;
        self.cache_put(id, CachedLock::Absent);
        Ok(Some(existing))
    }

    /// Drops the local cache.
    pub fn clear_caches(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.lock().len())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("clustered", &self.cache.is_none())
            .field("cache_size", &self.cache_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use vellum_mapper::{
        CopyResult, IdWithTypes, Invalidations, MemoryMapper, NodeInfo, Row, RowBatch, RowId,
        RowRead, SelectionType, Value,
    };
    use vellum_model::ModelBuilder;

    fn memory_mapper() -> Arc<MemoryMapper> {
        Arc::new(MemoryMapper::new(Arc::new(ModelBuilder::new().build())))
    }

    fn manager(mapper: Arc<dyn RowMapper>) -> LockManager {
        LockManager::new(mapper, false, 64, LockRetryPolicy::default())
    }

    #[test]
    fn lock_and_unlock() {
        let manager = manager(memory_mapper());
        let id = DocId::new();

        assert!(manager.get_lock(id).unwrap().is_none());
        assert!(manager.set_lock(id, "alice").unwrap().is_none());

        let lock = manager.get_lock(id).unwrap().unwrap();
        assert_eq!(lock.owner, "alice");

        let removed = manager.remove_lock(id, Some("alice")).unwrap().unwrap();
        assert!(!removed.failed);
        assert!(manager.get_lock(id).unwrap().is_none());
    }

    #[test]
    fn relock_returns_existing_owner() {
        let manager = manager(memory_mapper());
        let id = DocId::new();
        manager.set_lock(id, "alice").unwrap();
        let existing = manager.set_lock(id, "bob").unwrap().unwrap();
        assert_eq!(existing.owner, "alice");
        // alice still holds the lock
        assert_eq!(manager.get_lock(id).unwrap().unwrap().owner, "alice");
    }

    #[test]
    fn wrong_owner_cannot_unlock() {
        let manager = manager(memory_mapper());
        let id = DocId::new();
        manager.set_lock(id, "alice").unwrap();

        let result = manager.remove_lock(id, Some("bob")).unwrap().unwrap();
        assert!(result.failed);
        assert_eq!(result.owner, "alice");
        // the lock is still in place
        assert_eq!(manager.get_lock(id).unwrap().unwrap().owner, "alice");
    }

    #[test]
    fn none_owner_unlocks_unconditionally() {
        let manager = manager(memory_mapper());
        let id = DocId::new();
        manager.set_lock(id, "alice").unwrap();
        let removed = manager.remove_lock(id, None).unwrap().unwrap();
        assert!(!removed.failed);
        assert!(manager.get_lock(id).unwrap().is_none());
    }

    #[test]
    fn cached_lookup_avoids_round_trips() {
        let memory = memory_mapper();
        let manager = manager(Arc::clone(&memory) as Arc<dyn RowMapper>);
        let id = DocId::new();
        manager.get_lock(id).unwrap();
        let before = memory.read_count();
        manager.get_lock(id).unwrap();
        assert_eq!(memory.read_count(), before);
    }

    #[test]
    fn clustered_mode_has_no_cache() {
        let memory = memory_mapper();
        let manager = LockManager::new(
            Arc::clone(&memory) as Arc<dyn RowMapper>,
            true,
            64,
            LockRetryPolicy::default(),
        );
        let id = DocId::new();
        manager.get_lock(id).unwrap();
        let before = memory.read_count();
        manager.get_lock(id).unwrap();
        assert!(memory.read_count() > before);
        assert_eq!(manager.cache_size(), 0);
    }

    /// A mapper whose lock inserts always fail with a retryable
    /// conflict, counting the attempts.
    struct AlwaysConflicting {
        attempts: AtomicU32,
    }

    impl AlwaysConflicting {
        fn new() -> Self {
            Self {
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl RowMapper for AlwaysConflicting {
        fn read(&self, _row_ids: &[RowId], _cache_only: bool) -> StoreResult<Vec<RowRead>> {
            Ok(Vec::new())
        }
        fn read_simple_row(&self, _row_id: &RowId) -> StoreResult<Option<Row>> {
            Ok(None)
        }
        fn read_collection_array(&self, _row_id: &RowId) -> StoreResult<Option<Row>> {
            Ok(None)
        }
        fn read_selection_rows(
            &self,
            _selection: SelectionType,
            _selection_id: DocId,
            _filter: Option<(&str, &Value)>,
        ) -> StoreResult<Vec<Row>> {
            Ok(Vec::new())
        }
        fn write(&self, _batch: &RowBatch) -> StoreResult<()> {
            Ok(())
        }
        fn copy(
            &self,
            _source: &IdWithTypes,
            _dest_parent_id: Option<DocId>,
            _dest_name: Option<&str>,
            _overwrite_row: Option<&Row>,
        ) -> StoreResult<CopyResult> {
            Err(StoreError::invalid_operation("not supported"))
        }
        fn remove(&self, _root_info: &NodeInfo) -> StoreResult<Vec<NodeInfo>> {
            Ok(Vec::new())
        }
        fn get_lock(&self, _id: DocId) -> StoreResult<Option<Lock>> {
            Ok(None)
        }
        fn set_lock(&self, _id: DocId, _lock: &Lock) -> StoreResult<Option<Lock>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::concurrent_update("duplicate key"))
        }
        fn remove_lock(&self, _id: DocId) -> StoreResult<Option<Lock>> {
            Ok(None)
        }
        fn begin(&self) -> StoreResult<()> {
            Ok(())
        }
        fn commit(&self) -> StoreResult<()> {
            Ok(())
        }
        fn rollback(&self) -> StoreResult<()> {
            Ok(())
        }
        fn send_invalidations(&self, _invalidations: &Invalidations) -> StoreResult<()> {
            Ok(())
        }
        fn receive_invalidations(&self) -> StoreResult<Option<Invalidations>> {
            Ok(None)
        }
        fn clear_cache(&self) {}
        fn cache_size(&self) -> usize {
            0
        }
    }

    #[test]
    fn retry_bound_is_exact() {
        let conflicting = Arc::new(AlwaysConflicting::new());
        // tiny delays so the test doesn't sleep for real
        let policy = LockRetryPolicy {
            max_attempts: 10,
            first_delay: Duration::from_micros(1),
            delay_increment: Duration::from_micros(1),
        };
        let manager = LockManager::new(
            Arc::clone(&conflicting) as Arc<dyn RowMapper>,
            false,
            64,
            policy,
        );

        let result = manager.set_lock(DocId::new(), "alice");
        assert!(matches!(
            result,
            Err(StoreError::TooManyConcurrentUpdates { attempts: 10 })
        ));
        assert_eq!(conflicting.attempts.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn non_retryable_errors_surface_immediately() {
        struct Broken;
        impl RowMapper for Broken {
            fn read(&self, _r: &[RowId], _c: bool) -> StoreResult<Vec<RowRead>> {
                Ok(Vec::new())
            }
            fn read_simple_row(&self, _r: &RowId) -> StoreResult<Option<Row>> {
                Ok(None)
            }
            fn read_collection_array(&self, _r: &RowId) -> StoreResult<Option<Row>> {
                Ok(None)
            }
            fn read_selection_rows(
                &self,
                _s: SelectionType,
                _i: DocId,
                _f: Option<(&str, &Value)>,
            ) -> StoreResult<Vec<Row>> {
                Ok(Vec::new())
            }
            fn write(&self, _b: &RowBatch) -> StoreResult<()> {
                Ok(())
            }
            fn copy(
                &self,
                _s: &IdWithTypes,
                _d: Option<DocId>,
                _n: Option<&str>,
                _o: Option<&Row>,
            ) -> StoreResult<CopyResult> {
                Err(StoreError::invalid_operation("not supported"))
            }
            fn remove(&self, _r: &NodeInfo) -> StoreResult<Vec<NodeInfo>> {
                Ok(Vec::new())
            }
            fn get_lock(&self, _i: DocId) -> StoreResult<Option<Lock>> {
                Ok(None)
            }
            fn set_lock(&self, _i: DocId, _l: &Lock) -> StoreResult<Option<Lock>> {
                Err(StoreError::storage("disk on fire"))
            }
            fn remove_lock(&self, _i: DocId) -> StoreResult<Option<Lock>> {
                Ok(None)
            }
            fn begin(&self) -> StoreResult<()> {
                Ok(())
            }
            fn commit(&self) -> StoreResult<()> {
                Ok(())
            }
            fn rollback(&self) -> StoreResult<()> {
                Ok(())
            }
            fn send_invalidations(&self, _i: &Invalidations) -> StoreResult<()> {
                Ok(())
            }
            fn receive_invalidations(&self) -> StoreResult<Option<Invalidations>> {
                Ok(None)
            }
            fn clear_cache(&self) {}
            fn cache_size(&self) -> usize {
                0
            }
        }

        let manager = manager(Arc::new(Broken));
        let result = manager.set_lock(DocId::new(), "alice");
        assert!(matches!(result, Err(StoreError::Storage { .. })));
    }
}

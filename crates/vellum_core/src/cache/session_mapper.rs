//! Per-session caching mapper.

use super::row_cache::{CachedRow, RowCache};
use super::{batch_invalidations, removal_invalidations};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use vellum_mapper::{
    CopyResult, IdWithTypes, Invalidations, InvalidationsPropagator, InvalidationsQueue, Lock,
    NodeInfo, Row, RowBatch, RowId, RowMapper, RowRead, SelectionType, StoreResult, Value,
};
use vellum_model::{DocId, Model, FULLTEXT_TABLE};

/// Decorates a [`RowMapper`] with a cache owned by this session's
/// mapper alone.
///
/// Coherence with sibling sessions comes entirely from the invalidation
/// queues: every write accumulates local invalidations which are, at
/// commit, (a) forwarded to the underlying mapper, (b) propagated to
/// every sibling queue, (c) pushed to the cluster queue when one is
/// configured. At its next transaction start each session drains its own
/// queue and evicts accordingly. Readers never lock the cache against
/// writers; they may see stale-but-soon-to-be-invalidated data, which
/// the queue drain corrects at the transaction boundary.
pub struct SessionCachingMapper {
    underlying: Arc<dyn RowMapper>,
    model: Arc<Model>,
    cache: Arc<RowCache>,
    queue: Arc<InvalidationsQueue>,
    propagator: Arc<InvalidationsPropagator>,
    cluster_queue: Option<Arc<InvalidationsQueue>>,
    local: Mutex<Invalidations>,
}

impl SessionCachingMapper {
    /// Creates the decorator and registers its queue with the
    /// propagator.
    #[must_use]
    pub fn new(
        underlying: Arc<dyn RowMapper>,
        model: Arc<Model>,
        propagator: Arc<InvalidationsPropagator>,
        cluster_queue: Option<Arc<InvalidationsQueue>>,
        cache_size: usize,
    ) -> Self {
        let cache = Arc::new(RowCache::new(Arc::clone(&model), cache_size));
        let queue = Arc::new(InvalidationsQueue::new());
        propagator.add_queue(Arc::clone(&queue));
        Self {
            underlying,
            model,
            cache,
            queue,
            propagator,
            cluster_queue,
            local: Mutex::new(Invalidations::new()),
        }
    }

    /// The cache, for inspection in tests.
    #[must_use]
    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    fn cached_single(
        &self,
        row_id: &RowId,
        fetch: impl FnOnce() -> StoreResult<Option<Row>>,
    ) -> StoreResult<Option<Row>> {
        match self.cache.get(row_id) {
            Some(CachedRow::Row(row)) => return Ok(Some(row)),
            Some(CachedRow::Absent) => return Ok(None),
            None => {}
        }
        match fetch()? {
            Some(row) => {
                self.cache.put_row(row.clone());
                Ok(Some(row))
            }
            None => {
                self.cache.put_absent(row_id.clone());
                Ok(None)
            }
        }
    }
}

impl RowMapper for SessionCachingMapper {
    fn read(&self, row_ids: &[RowId], cache_only: bool) -> StoreResult<Vec<RowRead>> {
        let mut result = Vec::with_capacity(row_ids.len());
        let mut misses = Vec::new();
        for row_id in row_ids {
            match self.cache.get(row_id) {
                Some(CachedRow::Row(row)) => result.push(RowRead::Found(row)),
                Some(CachedRow::Absent) => result.push(RowRead::Absent(row_id.clone())),
                None if cache_only => result.push(RowRead::Absent(row_id.clone())),
                None => misses.push(row_id.clone()),
            }
        }
        if !misses.is_empty() {
            for read in self.underlying.read(&misses, false)? {
                match &read {
                    RowRead::Found(row) => self.cache.put_row(row.clone()),
                    RowRead::Absent(row_id) => self.cache.put_absent(row_id.clone()),
                }
                result.push(read);
            }
        }
        Ok(result)
    }

    fn read_simple_row(&self, row_id: &RowId) -> StoreResult<Option<Row>> {
        self.cached_single(row_id, || self.underlying.read_simple_row(row_id))
    }

    fn read_collection_array(&self, row_id: &RowId) -> StoreResult<Option<Row>> {
        self.cached_single(row_id, || self.underlying.read_collection_array(row_id))
    }

    fn read_selection_rows(
        &self,
        selection: SelectionType,
        selection_id: DocId,
        filter: Option<(&str, &Value)>,
    ) -> StoreResult<Vec<Row>> {
        let rows = self
            .underlying
            .read_selection_rows(selection, selection_id, filter)?;
        for row in &rows {
            self.cache.put_row(row.clone());
        }
        Ok(rows)
    }

    fn write(&self, batch: &RowBatch) -> StoreResult<()> {
        // write-through: the underlying store has the data before the
        // cache does
        self.underlying.write(batch)?;
        for row in &batch.creates {
            if row.id.table != FULLTEXT_TABLE {
                self.cache.put_row(row.clone());
            }
        }
        for update in &batch.updates {
            self.cache.apply_update(update);
        }
        for row_id in &batch.deletes {
            self.cache.put_absent(row_id.clone());
        }
        batch_invalidations(batch, &mut self.local.lock());
        Ok(())
    }

    fn copy(
        &self,
        source: &IdWithTypes,
        dest_parent_id: Option<DocId>,
        dest_name: Option<&str>,
        overwrite_row: Option<&Row>,
    ) -> StoreResult<CopyResult> {
        let result = self
            .underlying
            .copy(source, dest_parent_id, dest_name, overwrite_row)?;
        // rows overwritten in place are stale in our cache
        self.cache.apply_invalidations(&result.invalidations);
        self.local.lock().add(&result.invalidations);
        Ok(result)
    }

    fn remove(&self, root_info: &NodeInfo) -> StoreResult<Vec<NodeInfo>> {
        let infos = self.underlying.remove(root_info)?;
        let mut invalidations = Invalidations::new();
        removal_invalidations(&self.model, &infos, &mut invalidations);
        self.cache.apply_invalidations(&invalidations);
        self.local.lock().add(&invalidations);
        Ok(infos)
    }

    fn get_lock(&self, id: DocId) -> StoreResult<Option<Lock>> {
        self.underlying.get_lock(id)
    }

    fn set_lock(&self, id: DocId, lock: &Lock) -> StoreResult<Option<Lock>> {
        self.underlying.set_lock(id, lock)
    }

    fn remove_lock(&self, id: DocId) -> StoreResult<Option<Lock>> {
        self.underlying.remove_lock(id)
    }

    fn begin(&self) -> StoreResult<()> {
        self.underlying.begin()
    }

    fn commit(&self) -> StoreResult<()> {
        self.underlying.commit()?;
        let local = std::mem::take(&mut *self.local.lock());
        if local.is_empty() {
            return Ok(());
        }
        debug!(invalidations = %local, "propagating invalidations at commit");
        self.underlying.send_invalidations(&local)?;
        self.propagator.propagate(&local, Some(&self.queue));
        if let Some(cluster) = &self.cluster_queue {
            cluster.add(&local);
        }
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        self.underlying.rollback()?;
        *self.local.lock() = Invalidations::new();
        // the cache may hold rows from the rolled-back writes
        self.cache.clear();
        Ok(())
    }

    fn send_invalidations(&self, invalidations: &Invalidations) -> StoreResult<()> {
        self.local.lock().add(invalidations);
        Ok(())
    }

    fn receive_invalidations(&self) -> StoreResult<Option<Invalidations>> {
        let mut merged = Invalidations::new();
        if let Some(from_cluster) = self.underlying.receive_invalidations()? {
            merged.add(&from_cluster);
        }
        if let Some(queued) = self.queue.take() {
            merged.add(&queued);
        }
        if merged.is_empty() {
            return Ok(None);
        }
        self.cache.apply_invalidations(&merged);
        Ok(Some(merged))
    }

    fn clear_cache(&self) {
        self.cache.clear();
        self.underlying.clear_cache();
    }

    fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

impl Drop for SessionCachingMapper {
    fn drop(&mut self) {
        self.propagator.remove_queue(&self.queue);
    }
}

impl std::fmt::Debug for SessionCachingMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCachingMapper")
            .field("cache_size", &self.cache.len())
            .finish_non_exhaustive()
    }
}

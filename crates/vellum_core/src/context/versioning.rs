//! Versioning operations: checkin, checkout, series recomputation.

use super::{PersistenceContext, SelKind};
use crate::node::Node;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use vellum_mapper::{IdWithTypes, Row, StoreError, StoreResult, Value};
use vellum_model::{
    DocId, MAIN_BASE_VERSION_KEY, MAIN_CHECKED_IN_KEY, MAIN_IS_VERSION_KEY,
    MAIN_MAJOR_VERSION_KEY, MAIN_MINOR_VERSION_KEY, VERSION_CREATED_KEY, VERSION_DESCRIPTION_KEY,
    VERSION_IS_LATEST_KEY, VERSION_IS_LATEST_MAJOR_KEY, VERSION_LABEL_KEY, VERSION_TABLE,
    VERSION_VERSIONABLE_KEY,
};

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, forced strictly increasing so versions
/// checked in within the same millisecond keep their creation order.
fn now_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let mut last = LAST_TIMESTAMP.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

impl PersistenceContext {
    /// Checks in a node, creating a frozen version of it.
    ///
    /// The version is an unfiled snapshot copy of the node without its
    /// regular children. Returns the new version's id.
    pub fn check_in(
        &mut self,
        node: &Node,
        label: Option<&str>,
        description: Option<&str>,
    ) -> StoreResult<DocId> {
        let hier = node.hier_fragment();
        if self.get_value(hier, MAIN_CHECKED_IN_KEY)?.is_true() {
            return Err(StoreError::invalid_operation("already checked in"));
        }
        let label = match label {
            Some(label) => label.to_owned(),
            None => {
                // default to major.minor
                let guard = hier.read();
                let major = guard.get_long(MAIN_MAJOR_VERSION_KEY).unwrap_or(0);
                let minor = guard.get_long(MAIN_MINOR_VERSION_KEY).unwrap_or(0);
                format!("{major}.{minor}")
            }
        };

        // snapshot copy: unfiled, without regular children
        let id = node.id();
        let mapper = Arc::clone(&self.mapper);
        let result = mapper.copy(&IdWithTypes::new(id, node.primary_type()), None, None, None)?;
        let new_id = result.copy_id;
        self.mark_invalidated(&result.invalidations);

        let ver_hier = self
            .get_hier(new_id, false)?
            .ok_or_else(|| StoreError::storage(format!("version copy missing: {new_id}")))?;
        self.put_value(&ver_hier, MAIN_IS_VERSION_KEY, Value::Bool(true))?;
        let is_major = ver_hier.read().get_long(MAIN_MINOR_VERSION_KEY) == Some(0);

        let mut row = Row::new(VERSION_TABLE, new_id);
        row.put(VERSION_VERSIONABLE_KEY, Value::Id(id));
        row.put(VERSION_CREATED_KEY, Value::Timestamp(now_millis()));
        row.put(VERSION_LABEL_KEY, Value::from(label));
        row.put(
            VERSION_DESCRIPTION_KEY,
            match description {
                Some(text) => Value::from(text),
                None => Value::Null,
            },
        );
        row.put(VERSION_IS_LATEST_KEY, Value::Bool(true));
        row.put(VERSION_IS_LATEST_MAJOR_KEY, Value::Bool(is_major));
        self.create_version_fragment(row)?;

        // the original now points at its new base version
        self.put_value(hier, MAIN_CHECKED_IN_KEY, Value::Bool(true))?;
        self.put_value(hier, MAIN_BASE_VERSION_KEY, Value::Id(new_id))?;

        self.recompute_version_series(id)?;
        Ok(new_id)
    }

    /// Checks out a node.
    pub fn check_out(&mut self, node: &Node) -> StoreResult<()> {
        let hier = node.hier_fragment();
        if !self.get_value(hier, MAIN_CHECKED_IN_KEY)?.is_true() {
            return Err(StoreError::invalid_operation("already checked out"));
        }
        self.put_value(hier, MAIN_CHECKED_IN_KEY, Value::Bool(false))
    }

    /// Recomputes the latest flags over all versions of a series:
    /// exactly one version (the most recently created) ends up with
    /// `islatest`, and per major value at most one with
    /// `islatestmajor`.
    pub fn recompute_version_series(&mut self, series_id: DocId) -> StoreResult<()> {
        let mut fragments = self.selection_fragments(SelKind::SeriesVersions, series_id, None)?;
        fragments.sort_by_key(|fragment| {
            let guard = fragment.read();
            (guard.get(VERSION_CREATED_KEY).as_timestamp(), guard.id())
        });
        fragments.reverse();

        let mut is_latest = true;
        let mut is_latest_major = true;
        for fragment in fragments {
            self.put_value(&fragment, VERSION_IS_LATEST_KEY, Value::Bool(is_latest))?;
            is_latest = false;

            let version_id = fragment.read().id();
            let ver_hier = self
                .get_hier(version_id, true)?
                .ok_or_else(|| StoreError::storage(format!("missing version: {version_id}")))?;
            let is_major = ver_hier.read().get_long(MAIN_MINOR_VERSION_KEY) == Some(0);
            self.put_value(
                &fragment,
                VERSION_IS_LATEST_MAJOR_KEY,
                Value::Bool(is_major && is_latest_major),
            )?;
            if is_major {
                is_latest_major = false;
            }
        }
        Ok(())
    }

    /// The version ids of a series, in creation order.
    pub fn get_version_ids(&mut self, series_id: DocId) -> StoreResult<Vec<DocId>> {
        let mut fragments = self.selection_fragments(SelKind::SeriesVersions, series_id, None)?;
        fragments.sort_by_key(|fragment| {
            let guard = fragment.read();
            (guard.get(VERSION_CREATED_KEY).as_timestamp(), guard.id())
        });
        Ok(fragments.iter().map(|f| f.read().id()).collect())
    }

    /// Ids of the proxies of a version series.
    pub fn get_series_proxy_ids(&mut self, series_id: DocId) -> StoreResult<Vec<DocId>> {
        let fragments = self.selection_fragments(SelKind::SeriesProxies, series_id, None)?;
        Ok(fragments.iter().map(|f| f.read().id()).collect())
    }

    /// Ids of the proxies pointing at a target.
    pub fn get_target_proxy_ids(&mut self, target_id: DocId) -> StoreResult<Vec<DocId>> {
        let fragments = self.selection_fragments(SelKind::TargetProxies, target_id, None)?;
        Ok(fragments.iter().map(|f| f.read().id()).collect())
    }
}

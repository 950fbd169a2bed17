//! Row caching in front of a mapper, with cross-session invalidation.
//!
//! Two decorators exist:
//! - [`SessionCachingMapper`]: one cache per session mapper, coherence
//!   purely via the invalidation queues
//! - [`SharedCachingMapper`]: one cache shared by all mappers of a
//!   repository, row invalidations applied to it at commit
//!
//! Both are write-through: a write updates the cache and is forwarded to
//! the underlying mapper before returning, so a crash after `write()`
//! returns means the underlying store has the data.

mod row_cache;
mod session_mapper;
mod shared_mapper;

pub use row_cache::{CachedRow, RowCache};
pub use session_mapper::SessionCachingMapper;
pub use shared_mapper::SharedCachingMapper;

use vellum_mapper::{Invalidations, NodeInfo, RowBatch, RowId};
use vellum_model::{Model, FULLTEXT_TABLE};

/// Collects the invalidations a batch generates for other sessions.
///
/// Fulltext-table writes are excluded: the table is write-only, nobody
/// caches reads of it, so propagating would be pure overhead.
fn batch_invalidations(batch: &RowBatch, out: &mut Invalidations) {
    for row in &batch.creates {
        if row.id.table != FULLTEXT_TABLE {
            out.add_modified(row.id.clone());
        }
    }
    for update in &batch.updates {
        if update.row.id.table != FULLTEXT_TABLE {
            out.add_modified(update.row.id.clone());
        }
    }
    for row_id in &batch.deletes {
        if row_id.table != FULLTEXT_TABLE {
            out.add_deleted(row_id.clone());
        }
    }
}

/// Collects the invalidations generated by a recursive removal: every
/// fragment row of every removed node is deleted, and the root's parent
/// saw its child set change.
fn removal_invalidations(model: &Model, infos: &[NodeInfo], out: &mut Invalidations) {
    for info in infos {
        if let Ok(fragments) = model.type_fragments(&info.primary_type) {
            for fragment in fragments {
                out.add_deleted(RowId::new(fragment, info.id));
            }
        } else {
            // unknown type: invalidate at least the hierarchy row
            out.add_deleted(RowId::new(vellum_model::HIER_TABLE, info.id));
        }
    }
    if let Some(root) = infos.first() {
        if let Some(parent_id) = root.parent_id {
            out.add_modified_parent(parent_id);
        }
    }
}

//! Repository fixtures.

use std::sync::Arc;
use vellum_core::{
    RowCache, Session, SessionCachingMapper, SharedCachingMapper, StoreConfig,
};
use vellum_mapper::{InvalidationsPropagator, MemoryMapper, RowMapper};
use vellum_model::{Model, ModelBuilder, PropertyKind, ORDERABLE_FACET};

/// The canonical test model: `root`, `file`, `note` and an orderable
/// `folder`, with a fulltext-indexed title.
#[must_use]
pub fn base_model() -> Arc<Model> {
    Arc::new(
        ModelBuilder::new()
            .simple_fragment(
                "dublincore",
                &[
                    ("title", PropertyKind::String),
                    ("description", PropertyKind::String),
                    ("counter", PropertyKind::Long),
                ],
            )
            .expect("fragment")
            .simple_fragment("content", &[("data", PropertyKind::Binary)])
            .expect("fragment")
            .collection_fragment("contributors", PropertyKind::String)
            .expect("fragment")
            .property_alias("dc:title", "dublincore", Some("title"), false)
            .expect("alias")
            .doc_type("root", &[], &[])
            .expect("type")
            .doc_type("file", &["dublincore", "content", "contributors"], &[])
            .expect("type")
            .doc_type("note", &["dublincore"], &[])
            .expect("type")
            .doc_type("folder", &["dublincore"], &[ORDERABLE_FACET])
            .expect("type")
            .fulltext_index("dublincore", "title")
            .expect("fulltext")
            .fulltext_index("content", "data")
            .expect("fulltext")
            .build(),
    )
}

/// A repository fixture: one in-memory store shared by any number of
/// sessions, wired through one invalidation propagator.
pub struct TestRepository {
    /// The model.
    pub model: Arc<Model>,
    /// The backing store, for read counting and direct inspection.
    pub memory: Arc<MemoryMapper>,
    /// The repository's propagator.
    pub propagator: Arc<InvalidationsPropagator>,
    /// The shared row cache (used by [`TestRepository::shared_session`]).
    pub shared_cache: Arc<RowCache>,
    /// The configuration sessions are created with.
    pub config: StoreConfig,
}

impl TestRepository {
    /// Creates a repository over the canonical test model.
    #[must_use]
    pub fn new() -> Self {
        Self::with_model(base_model())
    }

    /// Creates a repository over a custom model.
    #[must_use]
    pub fn with_model(model: Arc<Model>) -> Self {
        let memory = Arc::new(MemoryMapper::new(Arc::clone(&model)));
        let config = StoreConfig::default();
        Self {
            shared_cache: Arc::new(RowCache::new(Arc::clone(&model), config.row_cache_size)),
            propagator: Arc::new(InvalidationsPropagator::new()),
            memory,
            model,
            config,
        }
    }

    /// Opens a session with a per-session cache (the common setup).
    #[must_use]
    pub fn session(&self) -> Session {
        let mapper: Arc<dyn RowMapper> = Arc::new(SessionCachingMapper::new(
            Arc::clone(&self.memory) as Arc<dyn RowMapper>,
            Arc::clone(&self.model),
            Arc::clone(&self.propagator),
            None,
            self.config.row_cache_size,
        ));
        Session::new(Arc::clone(&self.model), mapper, &self.config)
    }

    /// Opens a session over the repository-shared row cache.
    #[must_use]
    pub fn shared_session(&self) -> Session {
        let mapper: Arc<dyn RowMapper> = Arc::new(SharedCachingMapper::new(
            Arc::clone(&self.memory) as Arc<dyn RowMapper>,
            Arc::clone(&self.model),
            Arc::clone(&self.shared_cache),
            Arc::clone(&self.propagator),
            None,
        ));
        Session::new(Arc::clone(&self.model), mapper, &self.config)
    }

    /// Opens a session straight over the store, with no caching layer.
    #[must_use]
    pub fn raw_session(&self) -> Session {
        Session::new(
            Arc::clone(&self.model),
            Arc::clone(&self.memory) as Arc<dyn RowMapper>,
            &self.config,
        )
    }
}

impl Default for TestRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_opens_sessions() {
        let repo = TestRepository::new();
        let mut session = repo.session();
        let root = session.create_root("root").unwrap();
        session.save().unwrap();
        assert!(session.node_by_id(root.id()).unwrap().is_some());
        assert_eq!(repo.propagator.queue_count(), 1);
    }

    #[test]
    fn base_model_has_expected_types() {
        let model = base_model();
        assert!(model.is_doc_type("file"));
        assert!(model.has_facet("folder", ORDERABLE_FACET));
        assert!(model.is_collection_fragment("contributors"));
    }
}

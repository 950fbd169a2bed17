//! The caller-facing view over one logical document.

use crate::fragment::FragmentRef;
use vellum_mapper::{RowId, StoreError, StoreResult};
use vellum_model::{
    DocId, Model, HIER_IS_PROPERTY_KEY, HIER_NAME_KEY, HIER_PARENT_KEY, HIER_POS_KEY,
    MAIN_CHECKED_IN_KEY, MAIN_IS_VERSION_KEY, MAIN_PRIMARY_TYPE_KEY, PROXY_TYPE,
};
use vellum_model::PropertyKind;

/// A node in the repository: one document or complex property, composed
/// of its mandatory hierarchy fragment plus auxiliary fragments fetched
/// on demand through the session.
///
/// A node's identity is its hierarchy fragment's id. Nodes are
/// lightweight descriptors; all reads of fresh data and every write go
/// through the session owning the fragments.
#[derive(Debug, Clone)]
pub struct Node {
    id: DocId,
    primary_type: String,
    hier: FragmentRef,
}

impl Node {
    /// Wraps a hierarchy fragment.
    #[must_use]
    pub fn new(hier: FragmentRef) -> Self {
        let (id, primary_type) = {
            let guard = hier.read();
            (
                guard.id(),
                guard.get_string(MAIN_PRIMARY_TYPE_KEY).unwrap_or_default(),
            )
        };
        Self {
            id,
            primary_type,
            hier,
        }
    }

    /// The node id.
    #[must_use]
    pub fn id(&self) -> DocId {
        self.id
    }

    /// The node's primary document type.
    #[must_use]
    pub fn primary_type(&self) -> &str {
        &self.primary_type
    }

    /// The hierarchy fragment backing this node.
    #[must_use]
    pub fn hier_fragment(&self) -> &FragmentRef {
        &self.hier
    }

    /// The node's name under its parent.
    #[must_use]
    pub fn name(&self) -> String {
        self.hier.read().get_string(HIER_NAME_KEY).unwrap_or_default()
    }

    /// The parent id, `None` for a root.
    #[must_use]
    pub fn parent_id(&self) -> Option<DocId> {
        self.hier.read().get_id(HIER_PARENT_KEY)
    }

    /// The ordering position, `None` for unordered children.
    #[must_use]
    pub fn pos(&self) -> Option<i64> {
        self.hier.read().get_long(HIER_POS_KEY)
    }

    /// Whether the node is a complex property.
    #[must_use]
    pub fn is_complex_property(&self) -> bool {
        self.hier.read().is_true(HIER_IS_PROPERTY_KEY)
    }

    /// Whether the node is a frozen version.
    #[must_use]
    pub fn is_version(&self) -> bool {
        self.hier.read().is_true(MAIN_IS_VERSION_KEY)
    }

    /// Whether the node is a proxy.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.primary_type == PROXY_TYPE
    }

    /// Whether the node is checked in.
    #[must_use]
    pub fn is_checked_in(&self) -> bool {
        self.hier.read().is_true(MAIN_CHECKED_IN_KEY)
    }

    /// Resolves a simple (single-valued) property of this node through
    /// the model.
    pub fn simple_property(&self, model: &Model, name: &str) -> StoreResult<SimpleProperty> {
        let info = model.property_info(&self.primary_type, name)?;
        let Some(key) = info.key.clone() else {
            return Err(StoreError::invalid_operation(format!(
                "{name} is a collection property"
            )));
        };
        Ok(SimpleProperty {
            row_id: RowId::new(info.fragment.clone(), self.id),
            key,
            kind: info.kind,
            readonly: info.readonly,
        })
    }

    /// Resolves a collection (multi-valued) property of this node
    /// through the model.
    pub fn collection_property(&self, model: &Model, name: &str) -> StoreResult<CollectionProperty> {
        let info = model.property_info(&self.primary_type, name)?;
        if info.key.is_some() {
            return Err(StoreError::invalid_operation(format!(
                "{name} is a simple property"
            )));
        }
        Ok(CollectionProperty {
            row_id: RowId::new(info.fragment.clone(), self.id),
            kind: info.kind,
            readonly: info.readonly,
        })
    }
}

/// A resolved single-valued property: which row and column hold it.
///
/// Properties carry no data themselves; reads and writes go through the
/// session, which owns the fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleProperty {
    /// The row holding the property.
    pub row_id: RowId,
    /// The column within the row.
    pub key: String,
    /// The declared scalar kind.
    pub kind: PropertyKind,
    /// Whether the session API refuses writes.
    pub readonly: bool,
}

/// A resolved multi-valued property: which collection row holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionProperty {
    /// The collection row holding the values.
    pub row_id: RowId,
    /// The declared element kind.
    pub kind: PropertyKind,
    /// Whether the session API refuses writes.
    pub readonly: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Fragment, State};
    use vellum_mapper::{Row, Value};
    use vellum_model::{ModelBuilder, HIER_TABLE};

    fn model() -> Model {
        ModelBuilder::new()
            .simple_fragment("dublincore", &[("title", PropertyKind::String)])
            .unwrap()
            .collection_fragment("contributors", PropertyKind::String)
            .unwrap()
            .doc_type("file", &["dublincore", "contributors"], &[])
            .unwrap()
            .build()
    }

    fn file_node() -> Node {
        let id = DocId::new();
        let mut row = Row::new(HIER_TABLE, id);
        row.put(HIER_NAME_KEY, Value::from("doc"));
        row.put(MAIN_PRIMARY_TYPE_KEY, Value::from("file"));
        row.put(HIER_IS_PROPERTY_KEY, Value::Bool(false));
        Node::new(Fragment::from_row(row, State::Pristine).into_ref())
    }

    #[test]
    fn node_reads_hierarchy_fields() {
        let node = file_node();
        assert_eq!(node.name(), "doc");
        assert_eq!(node.primary_type(), "file");
        assert!(node.parent_id().is_none());
        assert!(!node.is_version());
        assert!(!node.is_proxy());
    }

    #[test]
    fn property_resolution_through_model() {
        let model = model();
        let node = file_node();

        let title = node.simple_property(&model, "dublincore:title").unwrap();
        assert_eq!(title.row_id.table, "dublincore");
        assert_eq!(title.row_id.id, node.id());
        assert_eq!(title.key, "title");

        let contributors = node.collection_property(&model, "contributors").unwrap();
        assert_eq!(contributors.row_id.table, "contributors");

        // shape mismatches fail fast
        assert!(node.collection_property(&model, "dublincore:title").is_err());
        assert!(node.simple_property(&model, "contributors").is_err());
        assert!(node.simple_property(&model, "nope:nope").is_err());
    }
}

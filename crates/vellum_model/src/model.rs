//! Repository model and its builder.

use crate::error::{ModelError, ModelResult};
use crate::id::DocId;
use crate::layout::*;
use crate::types::{FulltextKind, PropertyKind};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Resolution of a property name to its storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Fragment (table) holding the property.
    pub fragment: String,
    /// Column key within the fragment, `None` for a whole collection
    /// fragment.
    pub key: Option<String>,
    /// Scalar kind of the stored value(s).
    pub kind: PropertyKind,
    /// Whether the property may not be written through the session API.
    pub readonly: bool,
}

/// Layout of one fragment (table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentKind {
    /// One row per id, with named columns.
    Simple {
        /// Column name to column kind.
        keys: BTreeMap<String, PropertyKind>,
    },
    /// Several positional rows per id, flattened to an array.
    Collection {
        /// Kind of each array element.
        element: PropertyKind,
        /// Whether cached reads must reproduce `ORDER BY pos`.
        pos_ordered: bool,
    },
}

/// Per-fragment registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Layout of the fragment.
    pub kind: FragmentKind,
}

/// A registered document type.
#[derive(Debug, Clone)]
pub struct DocType {
    /// Schema fragments the type stores data in, in registration order.
    pub fragments: BTreeSet<String>,
    /// Facets carried by the type (e.g. [`ORDERABLE_FACET`]).
    pub facets: HashSet<String>,
}

/// Immutable mapping of document types and properties to table layout.
///
/// Built once per repository with [`ModelBuilder`], then shared read-only
/// (typically behind an `Arc`) by every session, mapper and cache. The
/// model never changes after `build()`, which is what makes lock-free
/// sharing across session threads sound.
#[derive(Debug)]
pub struct Model {
    types: HashMap<String, DocType>,
    fragments: HashMap<String, FragmentInfo>,
    /// Fragments every document has regardless of its type (the
    /// hierarchy, version, proxy, ACL, lock and fulltext tables).
    system_fragments: HashSet<String>,
    properties: HashMap<String, PropertyInfo>,
    fulltext_fragments: HashMap<String, FulltextKind>,
    fulltext_fields: HashMap<(String, String), FulltextKind>,
    proxies_enabled: bool,
}

impl Model {
    /// Generates a new unique id for a node or fragment row.
    #[must_use]
    pub fn generate_new_id(&self) -> DocId {
        DocId::new()
    }

    /// Whether proxy documents are enabled for this repository.
    #[must_use]
    pub fn proxies_enabled(&self) -> bool {
        self.proxies_enabled
    }

    /// Whether `name` is a registered document type.
    #[must_use]
    pub fn is_doc_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Returns the registration for a document type.
    pub fn doc_type(&self, name: &str) -> ModelResult<&DocType> {
        self.types
            .get(name)
            .ok_or_else(|| ModelError::unknown_type(name))
    }

    /// Resolves a property name for a document type.
    ///
    /// The property must be declared and its fragment must belong to
    /// the type; system-table properties resolve for every type.
    pub fn property_info(&self, doc_type: &str, property: &str) -> ModelResult<&PropertyInfo> {
        let info = self
            .properties
            .get(property)
            .ok_or_else(|| ModelError::unknown_property(doc_type, property))?;
        if !self.system_fragments.contains(&info.fragment) {
            let dt = self.doc_type(doc_type)?;
            if !dt.fragments.contains(&info.fragment) {
                return Err(ModelError::unknown_property(doc_type, property));
            }
        }
        Ok(info)
    }

    /// Whether a fragment is a system table present for every document.
    #[must_use]
    pub fn is_system_fragment(&self, table: &str) -> bool {
        self.system_fragments.contains(table)
    }

    /// Returns the data fragments of a type: the hierarchy fragment, the
    /// ACL fragment and every declared schema fragment.
    pub fn type_fragments(&self, doc_type: &str) -> ModelResult<Vec<String>> {
        let dt = self.doc_type(doc_type)?;
        let mut fragments = Vec::with_capacity(dt.fragments.len() + 2);
        fragments.push(HIER_TABLE.to_owned());
        fragments.push(ACL_TABLE.to_owned());
        fragments.extend(dt.fragments.iter().cloned());
        Ok(fragments)
    }

    /// Returns the facets of a document type, or an empty set for an
    /// unknown type.
    #[must_use]
    pub fn type_facets(&self, doc_type: &str) -> HashSet<String> {
        self.types
            .get(doc_type)
            .map(|dt| dt.facets.clone())
            .unwrap_or_default()
    }

    /// Whether a document type carries the given facet.
    #[must_use]
    pub fn has_facet(&self, doc_type: &str, facet: &str) -> bool {
        self.types
            .get(doc_type)
            .is_some_and(|dt| dt.facets.contains(facet))
    }

    /// Returns the registration for a fragment.
    pub fn fragment(&self, table: &str) -> ModelResult<&FragmentInfo> {
        self.fragments
            .get(table)
            .ok_or_else(|| ModelError::unknown_fragment(table))
    }

    /// All registered fragment names, system tables included.
    pub fn fragment_names(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }

    /// Whether a fragment holds positional collection rows.
    #[must_use]
    pub fn is_collection_fragment(&self, table: &str) -> bool {
        matches!(
            self.fragments.get(table),
            Some(FragmentInfo {
                kind: FragmentKind::Collection { .. }
            })
        )
    }

    /// Element kind of a collection fragment, if it is one.
    #[must_use]
    pub fn collection_element_kind(&self, table: &str) -> Option<PropertyKind> {
        match self.fragments.get(table) {
            Some(FragmentInfo {
                kind: FragmentKind::Collection { element, .. },
            }) => Some(*element),
            _ => None,
        }
    }

    /// Whether cached reads of a collection fragment must be re-sorted by
    /// position (ACLs).
    #[must_use]
    pub fn is_pos_ordered_collection(&self, table: &str) -> bool {
        matches!(
            self.fragments.get(table),
            Some(FragmentInfo {
                kind: FragmentKind::Collection {
                    pos_ordered: true,
                    ..
                }
            })
        )
    }

    /// Column layout of a simple fragment.
    pub fn fragment_keys(&self, table: &str) -> ModelResult<&BTreeMap<String, PropertyKind>> {
        match &self.fragment(table)?.kind {
            FragmentKind::Simple { keys } => Ok(keys),
            FragmentKind::Collection { .. } => Err(ModelError::invalid(format!(
                "fragment {table} is a collection"
            ))),
        }
    }

    /// Aggregate fulltext kind of a fragment, `None` when nothing in it
    /// is indexed.
    #[must_use]
    pub fn fulltext_info_for_fragment(&self, table: &str) -> Option<FulltextKind> {
        self.fulltext_fragments.get(table).copied()
    }

    /// Fulltext kind of a single field, `None` when it is not indexed.
    #[must_use]
    pub fn fulltext_field_kind(&self, table: &str, key: &str) -> Option<FulltextKind> {
        self.fulltext_fields
            .get(&(table.to_owned(), key.to_owned()))
            .copied()
    }
}

/// Builder for [`Model`].
///
/// The system tables (hierarchy, versions, proxies, acls, locks,
/// fulltext) and the `proxy` document type are pre-registered; callers
/// add schema fragments, document types and fulltext indexing on top.
#[derive(Debug)]
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    /// Creates a builder with the system layout pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let mut builder = Self {
            model: Model {
                types: HashMap::new(),
                fragments: HashMap::new(),
                system_fragments: HashSet::new(),
                properties: HashMap::new(),
                fulltext_fragments: HashMap::new(),
                fulltext_fields: HashMap::new(),
                proxies_enabled: true,
            },
        };
        builder.register_system_layout();
        builder.model.system_fragments =
            builder.model.fragments.keys().cloned().collect();
        builder
    }

    fn register_system_layout(&mut self) {
        use PropertyKind as K;
        self.register_simple(
            HIER_TABLE,
            &[
                (HIER_PARENT_KEY, K::Id),
                (HIER_NAME_KEY, K::String),
                (HIER_POS_KEY, K::Long),
                (HIER_IS_PROPERTY_KEY, K::Bool),
                (MAIN_PRIMARY_TYPE_KEY, K::String),
                (MAIN_IS_VERSION_KEY, K::Bool),
                (MAIN_CHECKED_IN_KEY, K::Bool),
                (MAIN_BASE_VERSION_KEY, K::Id),
                (MAIN_MAJOR_VERSION_KEY, K::Long),
                (MAIN_MINOR_VERSION_KEY, K::Long),
            ],
        );
        self.register_simple(
            VERSION_TABLE,
            &[
                (VERSION_VERSIONABLE_KEY, K::Id),
                (VERSION_CREATED_KEY, K::Timestamp),
                (VERSION_LABEL_KEY, K::String),
                (VERSION_DESCRIPTION_KEY, K::String),
                (VERSION_IS_LATEST_KEY, K::Bool),
                (VERSION_IS_LATEST_MAJOR_KEY, K::Bool),
            ],
        );
        self.register_simple(
            PROXY_TABLE,
            &[
                (PROXY_TARGET_KEY, K::Id),
                (PROXY_VERSIONABLE_KEY, K::Id),
            ],
        );
        self.register_simple(
            LOCK_TABLE,
            &[(LOCK_OWNER_KEY, K::String), (LOCK_CREATED_KEY, K::Timestamp)],
        );
        self.register_simple(
            FULLTEXT_TABLE,
            &[
                (FULLTEXT_SIMPLETEXT_KEY, K::String),
                (FULLTEXT_BINARYTEXT_KEY, K::String),
            ],
        );
        self.model.fragments.insert(
            ACL_TABLE.to_owned(),
            FragmentInfo {
                kind: FragmentKind::Collection {
                    element: K::Acl,
                    pos_ordered: true,
                },
            },
        );
        // the proxy pseudo-type stores nothing beyond its system rows
        self.model.types.insert(
            PROXY_TYPE.to_owned(),
            DocType {
                fragments: BTreeSet::new(),
                facets: HashSet::new(),
            },
        );
    }

    fn register_simple(&mut self, table: &str, keys: &[(&str, PropertyKind)]) {
        let mut map = BTreeMap::new();
        for (key, kind) in keys {
            map.insert((*key).to_owned(), *kind);
            self.model.properties.insert(
                format!("{table}:{key}"),
                PropertyInfo {
                    fragment: table.to_owned(),
                    key: Some((*key).to_owned()),
                    kind: *kind,
                    readonly: false,
                },
            );
        }
        self.model
            .fragments
            .insert(table.to_owned(), FragmentInfo {
                kind: FragmentKind::Simple { keys: map },
            });
    }

    /// Enables or disables proxy documents.
    #[must_use]
    pub fn proxies_enabled(mut self, enabled: bool) -> Self {
        self.model.proxies_enabled = enabled;
        self
    }

    /// Registers a simple schema fragment and `fragment:key` properties
    /// for each of its columns.
    pub fn simple_fragment(
        mut self,
        name: &str,
        keys: &[(&str, PropertyKind)],
    ) -> ModelResult<Self> {
        if self.model.fragments.contains_key(name) {
            return Err(ModelError::duplicate(format!("fragment {name}")));
        }
        self.register_simple(name, keys);
        Ok(self)
    }

    /// Registers a collection schema fragment; the whole array is
    /// addressed by the property named after the fragment.
    pub fn collection_fragment(mut self, name: &str, element: PropertyKind) -> ModelResult<Self> {
        if self.model.fragments.contains_key(name) {
            return Err(ModelError::duplicate(format!("fragment {name}")));
        }
        self.model.fragments.insert(
            name.to_owned(),
            FragmentInfo {
                kind: FragmentKind::Collection {
                    element,
                    pos_ordered: false,
                },
            },
        );
        self.model.properties.insert(
            name.to_owned(),
            PropertyInfo {
                fragment: name.to_owned(),
                key: None,
                kind: element,
                readonly: false,
            },
        );
        Ok(self)
    }

    /// Registers an extra name for an existing property location, e.g.
    /// `dc:title` for `dublincore:title`.
    pub fn property_alias(
        mut self,
        alias: &str,
        fragment: &str,
        key: Option<&str>,
        readonly: bool,
    ) -> ModelResult<Self> {
        let kind = match (self.model.fragments.get(fragment), key) {
            (None, _) => return Err(ModelError::unknown_fragment(fragment)),
            (
                Some(FragmentInfo {
                    kind: FragmentKind::Simple { keys },
                }),
                Some(key),
            ) => *keys.get(key).ok_or_else(|| {
                ModelError::invalid(format!("no key {key} in fragment {fragment}"))
            })?,
            (
                Some(FragmentInfo {
                    kind: FragmentKind::Collection { element, .. },
                }),
                None,
            ) => *element,
            _ => {
                return Err(ModelError::invalid(format!(
                    "key presence does not match fragment {fragment} layout"
                )))
            }
        };
        self.model.properties.insert(
            alias.to_owned(),
            PropertyInfo {
                fragment: fragment.to_owned(),
                key: key.map(str::to_owned),
                kind,
                readonly,
            },
        );
        Ok(self)
    }

    /// Registers a document type with its schema fragments and facets.
    pub fn doc_type(mut self, name: &str, fragments: &[&str], facets: &[&str]) -> ModelResult<Self> {
        if self.model.types.contains_key(name) {
            return Err(ModelError::duplicate(format!("type {name}")));
        }
        for fragment in fragments {
            if !self.model.fragments.contains_key(*fragment) {
                return Err(ModelError::unknown_fragment(*fragment));
            }
        }
        self.model.types.insert(
            name.to_owned(),
            DocType {
                fragments: fragments.iter().map(|f| (*f).to_owned()).collect(),
                facets: facets.iter().map(|f| (*f).to_owned()).collect(),
            },
        );
        Ok(self)
    }

    /// Marks a fragment field as fulltext-indexed.
    pub fn fulltext_index(mut self, fragment: &str, key: &str) -> ModelResult<Self> {
        let kind = match &self.model.fragment(fragment)?.kind {
            FragmentKind::Simple { keys } => *keys.get(key).ok_or_else(|| {
                ModelError::invalid(format!("no key {key} in fragment {fragment}"))
            })?,
            FragmentKind::Collection { element, .. } => *element,
        };
        let ft = if kind.is_fulltext_binary() {
            FulltextKind::Binary
        } else {
            FulltextKind::Simple
        };
        self.model
            .fulltext_fields
            .insert((fragment.to_owned(), key.to_owned()), ft);
        let merged = match (self.model.fulltext_fragments.get(fragment), ft) {
            (None, ft) => ft,
            (Some(prev), ft) if *prev == ft => ft,
            _ => FulltextKind::Both,
        };
        self.model
            .fulltext_fragments
            .insert(fragment.to_owned(), merged);
        Ok(self)
    }

    /// Finalizes the model.
    #[must_use]
    pub fn build(self) -> Model {
        self.model
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> Model {
        ModelBuilder::new()
            .simple_fragment(
                "dublincore",
                &[
                    ("title", PropertyKind::String),
                    ("description", PropertyKind::String),
                    ("counter", PropertyKind::Long),
                ],
            )
            .unwrap()
            .collection_fragment("contributors", PropertyKind::String)
            .unwrap()
            .property_alias("dc:title", "dublincore", Some("title"), false)
            .unwrap()
            .doc_type("file", &["dublincore", "contributors"], &[])
            .unwrap()
            .doc_type("folder", &["dublincore"], &[ORDERABLE_FACET])
            .unwrap()
            .fulltext_index("dublincore", "title")
            .unwrap()
            .build()
    }

    #[test]
    fn system_layout_is_registered() {
        let model = ModelBuilder::new().build();
        assert!(model.fragment(HIER_TABLE).is_ok());
        assert!(model.fragment(VERSION_TABLE).is_ok());
        assert!(model.is_collection_fragment(ACL_TABLE));
        assert!(model.is_pos_ordered_collection(ACL_TABLE));
        assert!(model.is_doc_type(PROXY_TYPE));
    }

    #[test]
    fn property_resolution() {
        let model = sample_model();
        let info = model.property_info("file", "dc:title").unwrap();
        assert_eq!(info.fragment, "dublincore");
        assert_eq!(info.key.as_deref(), Some("title"));
        assert_eq!(info.kind, PropertyKind::String);

        let info = model.property_info("file", "contributors").unwrap();
        assert!(info.key.is_none());
    }

    #[test]
    fn property_requires_fragment_membership() {
        let model = sample_model();
        // folder has no contributors fragment
        assert!(model.property_info("folder", "contributors").is_err());
        // hierarchy columns resolve for every type
        assert!(model.property_info("folder", "hierarchy:majorversion").is_ok());
    }

    #[test]
    fn facets_drive_orderability() {
        let model = sample_model();
        assert!(model.has_facet("folder", ORDERABLE_FACET));
        assert!(!model.has_facet("file", ORDERABLE_FACET));
        assert!(!model.has_facet("nosuchtype", ORDERABLE_FACET));
    }

    #[test]
    fn type_fragments_include_system_tables() {
        let model = sample_model();
        let fragments = model.type_fragments("file").unwrap();
        assert!(fragments.contains(&HIER_TABLE.to_owned()));
        assert!(fragments.contains(&ACL_TABLE.to_owned()));
        assert!(fragments.contains(&"dublincore".to_owned()));
    }

    #[test]
    fn fulltext_configuration() {
        let model = sample_model();
        assert_eq!(
            model.fulltext_info_for_fragment("dublincore"),
            Some(FulltextKind::Simple)
        );
        assert_eq!(
            model.fulltext_field_kind("dublincore", "title"),
            Some(FulltextKind::Simple)
        );
        assert_eq!(model.fulltext_field_kind("dublincore", "description"), None);
        assert_eq!(model.fulltext_info_for_fragment("contributors"), None);
    }

    #[test]
    fn duplicate_registrations_fail() {
        let res = ModelBuilder::new()
            .simple_fragment("a", &[("x", PropertyKind::String)])
            .unwrap()
            .simple_fragment("a", &[("y", PropertyKind::String)]);
        assert!(res.is_err());
    }
}

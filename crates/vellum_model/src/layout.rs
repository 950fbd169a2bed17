//! Well-known table and column names of the repository layout.
//!
//! These names are part of the storage contract: the hierarchy, version,
//! proxy, ACL, lock and fulltext tables exist for every repository,
//! whatever document types it declares.

/// Main hierarchy table. One row per node, document or complex property.
pub const HIER_TABLE: &str = "hierarchy";
/// Parent id column of the hierarchy table.
pub const HIER_PARENT_KEY: &str = "parentid";
/// Child name column of the hierarchy table.
pub const HIER_NAME_KEY: &str = "name";
/// Ordering position column, `null` for unordered children.
pub const HIER_POS_KEY: &str = "pos";
/// Whether the row is a complex property rather than a document.
pub const HIER_IS_PROPERTY_KEY: &str = "isproperty";
/// Primary document type of the node.
pub const MAIN_PRIMARY_TYPE_KEY: &str = "primarytype";
/// Whether the node is a frozen version.
pub const MAIN_IS_VERSION_KEY: &str = "isversion";
/// Whether the node is checked in.
pub const MAIN_CHECKED_IN_KEY: &str = "ischeckedin";
/// Id of the base version of a checked-in node.
pub const MAIN_BASE_VERSION_KEY: &str = "baseversionid";
/// Major version number.
pub const MAIN_MAJOR_VERSION_KEY: &str = "majorversion";
/// Minor version number.
pub const MAIN_MINOR_VERSION_KEY: &str = "minorversion";

/// Version bookkeeping table, one row per frozen version.
pub const VERSION_TABLE: &str = "versions";
/// Id of the live document the version was created from.
pub const VERSION_VERSIONABLE_KEY: &str = "versionableid";
/// Creation timestamp of the version.
pub const VERSION_CREATED_KEY: &str = "created";
/// Version label.
pub const VERSION_LABEL_KEY: &str = "label";
/// Checkin comment.
pub const VERSION_DESCRIPTION_KEY: &str = "description";
/// Whether this is the latest version of its series.
pub const VERSION_IS_LATEST_KEY: &str = "islatest";
/// Whether this is the latest major version of its series.
pub const VERSION_IS_LATEST_MAJOR_KEY: &str = "islatestmajor";

/// Proxy table, one row per proxy document.
pub const PROXY_TABLE: &str = "proxies";
/// Id of the version (or document) the proxy points to.
pub const PROXY_TARGET_KEY: &str = "targetid";
/// Id of the version series the proxy belongs to.
pub const PROXY_VERSIONABLE_KEY: &str = "versionableid";
/// Primary type name reserved for proxy documents.
pub const PROXY_TYPE: &str = "proxy";

/// ACL table, a position-ordered collection per document.
pub const ACL_TABLE: &str = "acls";

/// Lock table, one row per locked document.
pub const LOCK_TABLE: &str = "locks";
/// Lock owner column.
pub const LOCK_OWNER_KEY: &str = "owner";
/// Lock creation timestamp column.
pub const LOCK_CREATED_KEY: &str = "created";

/// Fulltext table. Write-only from the core's point of view: nothing
/// caches reads of it, and writes to it are not propagated as
/// invalidations.
pub const FULLTEXT_TABLE: &str = "fulltext";
/// Extracted simple text column.
pub const FULLTEXT_SIMPLETEXT_KEY: &str = "simpletext";
/// Extracted binary text column.
pub const FULLTEXT_BINARYTEXT_KEY: &str = "binarytext";

/// Facet marking a document type whose children are explicitly ordered.
pub const ORDERABLE_FACET: &str = "orderable";

//! Stored values.

use std::fmt;
use vellum_model::DocId;

/// An incremental update to a counter-like column.
///
/// A delta records the full value it was computed from (`base`) and the
/// increment to apply. At flush time the mapper applies
/// `column = base + delta` semantics; within a session, deltas on the
/// same key combine by summing their increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaLong {
    /// The full value the delta was computed against.
    pub base: i64,
    /// The increment to apply.
    pub delta: i64,
}

impl DeltaLong {
    /// Creates a delta.
    #[must_use]
    pub const fn new(base: i64, delta: i64) -> Self {
        Self { base, delta }
    }

    /// The value after applying the increment.
    #[must_use]
    pub const fn full_value(self) -> i64 {
        self.base + self.delta
    }

    /// Combines a later delta into this one; increments sum.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self {
            base: self.base,
            delta: self.delta + other.delta,
        }
    }
}

/// One access-control entry of a position-ordered ACL collection.
#[derive(Debug, Clone, PartialEq)]
pub struct AclEntry {
    /// Position within the ACL, `None` when unassigned.
    pub pos: Option<i64>,
    /// User or group the entry applies to.
    pub user: String,
    /// Permission name.
    pub permission: String,
    /// Grant or deny.
    pub grant: bool,
}

/// A single stored value.
///
/// `Opaque` is the write-side "don't care, don't overwrite" marker: a
/// copy operation uses it for columns it must leave untouched. It never
/// comes back from a read.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Null / absent column.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Node or row id.
    Id(DocId),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Content-addressed binary digest.
    Binary(String),
    /// Counter delta, resolved to `base + delta` at flush.
    Delta(DeltaLong),
    /// ACL collection element.
    Acl(Box<AclEntry>),
    /// Don't care, don't overwrite.
    Opaque,
}

impl Value {
    /// Whether the value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value is the opaque marker.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque)
    }

    /// Resolves deltas to their full value; other values are returned
    /// unchanged.
    #[must_use]
    pub fn resolved(&self) -> Value {
        match self {
            Self::Delta(d) => Self::Long(d.full_value()),
            other => other.clone(),
        }
    }

    /// The value as a long, resolving deltas.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::Delta(d) => Some(d.full_value()),
            _ => None,
        }
    }

    /// The value as a bool.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the value is boolean true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    /// The value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an id.
    #[must_use]
    pub fn as_id(&self) -> Option<DocId> {
        match self {
            Self::Id(id) => Some(*id),
            _ => None,
        }
    }

    /// The value as a timestamp in milliseconds.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Self::Timestamp(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Whether two values denote the same stored content, comparing
    /// deltas by their full value.
    #[must_use]
    pub fn same_stored(&self, other: &Value) -> bool {
        match (self.as_long(), other.as_long()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Id(v) => write!(f, "{v}"),
            Self::Timestamp(ms) => write!(f, "ts:{ms}"),
            Self::Binary(digest) => write!(f, "bin:{digest}"),
            Self::Delta(d) => write!(f, "{}+{}", d.base, d.delta),
            Self::Acl(e) => write!(f, "acl:{}:{}:{}", e.user, e.permission, e.grant),
            Self::Opaque => f.write_str("<opaque>"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<DocId> for Value {
    fn from(id: DocId) -> Self {
        Self::Id(id)
    }
}

//! Property type definitions.

use std::fmt;

/// Scalar type of a stored property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// Millisecond timestamp.
    Timestamp,
    /// Node or fragment id.
    Id,
    /// Content-addressed binary digest.
    Binary,
    /// Access control entry (positional collections only).
    Acl,
}

impl PropertyKind {
    /// Whether values of this kind contribute to string fulltext.
    #[must_use]
    pub fn is_fulltext_string(self) -> bool {
        matches!(self, Self::String)
    }

    /// Whether values of this kind contribute to binary fulltext.
    #[must_use]
    pub fn is_fulltext_binary(self) -> bool {
        matches!(self, Self::Binary)
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Long => "long",
            Self::Double => "double",
            Self::Timestamp => "timestamp",
            Self::Id => "id",
            Self::Binary => "binary",
            Self::Acl => "acl",
        };
        f.write_str(name)
    }
}

/// What kind of fulltext a fragment or field feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulltextKind {
    /// Simple (string) text only.
    Simple,
    /// Binary text only.
    Binary,
    /// Both simple and binary text.
    Both,
}

impl FulltextKind {
    /// Whether string reindexing is needed.
    #[must_use]
    pub fn dirties_strings(self) -> bool {
        matches!(self, Self::Simple | Self::Both)
    }

    /// Whether binary reindexing is needed.
    #[must_use]
    pub fn dirties_binaries(self) -> bool {
        matches!(self, Self::Binary | Self::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulltext_kind_dirtiness() {
        assert!(FulltextKind::Simple.dirties_strings());
        assert!(!FulltextKind::Simple.dirties_binaries());
        assert!(FulltextKind::Both.dirties_strings());
        assert!(FulltextKind::Both.dirties_binaries());
    }

    #[test]
    fn display_names() {
        assert_eq!(PropertyKind::String.to_string(), "string");
        assert_eq!(PropertyKind::Timestamp.to_string(), "timestamp");
    }
}

//! Error types for HDF5 group storage.

#[cfg(not(feature = "std"))]
use alloc::string::String;

use core::fmt;

/// Coarse classification of a [`FormatError`].
///
/// Callers match on the kind; the error itself carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A path component, key, link target or mount point is absent.
    NotFound,
    /// An insert collided with an existing name.
    AlreadyExists,
    /// Malformed on-disk structure or an invariant broken mid-traversal.
    CorruptIndex,
    /// The soft-link follow counter reached zero.
    TooManySymlinks,
    /// The entry lacks the symbol-table metadata of a group.
    BadMessage,
    /// Storage could not grow.
    OutOfSpace,
    /// A hard link would cross two files.
    InterfileLink,
    /// Empty or malformed path name.
    InvalidName,
    /// File creation or access properties are out of range.
    InvalidConfig,
}

/// Errors raised by the heap, B-tree, symbol-table and name layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The HDF5 magic signature was not found at any valid offset.
    SignatureNotFound,
    /// The superblock version is not supported.
    UnsupportedVersion(u8),
    /// Unexpected end of data.
    UnexpectedEof {
        /// Number of bytes expected.
        expected: usize,
        /// Number of bytes actually available.
        available: usize,
    },
    /// Invalid offset size (must be 2, 4, or 8).
    InvalidOffsetSize(u8),
    /// Invalid length size (must be 2, 4, or 8).
    InvalidLengthSize(u8),
    /// Missing "TREE" signature.
    InvalidBTreeSignature,
    /// B-tree node type does not match the class reading it.
    InvalidBTreeNodeType(u8),
    /// Missing "HEAP" signature.
    InvalidLocalHeapSignature,
    /// Local heap version other than 0.
    InvalidLocalHeapVersion(u8),
    /// Missing "SNOD" signature.
    InvalidSymbolTableNodeSignature,
    /// Symbol table node version other than 1.
    InvalidSymbolTableNodeVersion(u8),
    /// Object header version other than 1.
    InvalidObjectHeaderVersion(u8),
    /// Symbol table entry cache type outside 0..=2.
    InvalidCacheType(u32),
    /// Structural invariant violated while walking an index.
    CorruptIndex(String),
    /// Name or key not present.
    NotFound(String),
    /// Name already present.
    AlreadyExists(String),
    /// Soft-link chain exceeded the configured limit.
    TooManySymlinks(String),
    /// Object is not a group (no symbol-table message).
    BadMessage(String),
    /// Storage growth failed.
    OutOfSpace {
        /// Bytes requested.
        requested: u64,
        /// Largest address the storage accepts.
        limit: u64,
    },
    /// Hard link across two independent files.
    InterfileLink,
    /// Empty or malformed path name.
    InvalidName(String),
    /// Property value out of range.
    InvalidConfig(String),
}

impl FormatError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FormatError::NotFound(_) => ErrorKind::NotFound,
            FormatError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FormatError::TooManySymlinks(_) => ErrorKind::TooManySymlinks,
            FormatError::BadMessage(_) => ErrorKind::BadMessage,
            FormatError::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            FormatError::InterfileLink => ErrorKind::InterfileLink,
            FormatError::InvalidName(_) => ErrorKind::InvalidName,
            FormatError::InvalidConfig(_)
            | FormatError::InvalidOffsetSize(_)
            | FormatError::InvalidLengthSize(_) => ErrorKind::InvalidConfig,
            FormatError::SignatureNotFound
            | FormatError::UnsupportedVersion(_)
            | FormatError::UnexpectedEof { .. }
            | FormatError::InvalidBTreeSignature
            | FormatError::InvalidBTreeNodeType(_)
            | FormatError::InvalidLocalHeapSignature
            | FormatError::InvalidLocalHeapVersion(_)
            | FormatError::InvalidSymbolTableNodeSignature
            | FormatError::InvalidSymbolTableNodeVersion(_)
            | FormatError::InvalidObjectHeaderVersion(_)
            | FormatError::InvalidCacheType(_)
            | FormatError::CorruptIndex(_) => ErrorKind::CorruptIndex,
        }
    }

    /// True when this is a `NotFound` probe result.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::SignatureNotFound => {
                write!(f, "HDF5 signature not found at any valid offset")
            }
            FormatError::UnsupportedVersion(v) => {
                write!(f, "unsupported superblock version: {v}")
            }
            FormatError::UnexpectedEof {
                expected,
                available,
            } => {
                write!(f, "unexpected EOF: need {expected} bytes, have {available}")
            }
            FormatError::InvalidOffsetSize(s) => {
                write!(f, "invalid offset size: {s} (must be 2, 4, or 8)")
            }
            FormatError::InvalidLengthSize(s) => {
                write!(f, "invalid length size: {s} (must be 2, 4, or 8)")
            }
            FormatError::InvalidBTreeSignature => write!(f, "invalid B-tree node signature"),
            FormatError::InvalidBTreeNodeType(t) => {
                write!(f, "unexpected B-tree node type: {t}")
            }
            FormatError::InvalidLocalHeapSignature => write!(f, "invalid local heap signature"),
            FormatError::InvalidLocalHeapVersion(v) => {
                write!(f, "unsupported local heap version: {v}")
            }
            FormatError::InvalidSymbolTableNodeSignature => {
                write!(f, "invalid symbol table node signature")
            }
            FormatError::InvalidSymbolTableNodeVersion(v) => {
                write!(f, "unsupported symbol table node version: {v}")
            }
            FormatError::InvalidObjectHeaderVersion(v) => {
                write!(f, "unsupported object header version: {v}")
            }
            FormatError::InvalidCacheType(t) => {
                write!(f, "invalid symbol table entry cache type: {t}")
            }
            FormatError::CorruptIndex(msg) => write!(f, "corrupt index: {msg}"),
            FormatError::NotFound(name) => write!(f, "not found: {name}"),
            FormatError::AlreadyExists(name) => write!(f, "already exists: {name}"),
            FormatError::TooManySymlinks(name) => {
                write!(f, "too many symbolic links while resolving {name}")
            }
            FormatError::BadMessage(what) => {
                write!(f, "unexpected object: {what}")
            }
            FormatError::OutOfSpace { requested, limit } => {
                write!(f, "out of space: {requested} bytes requested, limit {limit:#x}")
            }
            FormatError::InterfileLink => {
                write!(f, "hard links across files are not allowed")
            }
            FormatError::InvalidName(name) => write!(f, "invalid name: {name:?}"),
            FormatError::InvalidConfig(msg) => write!(f, "invalid property: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FormatError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_corrupt_index() {
        let e = FormatError::UnexpectedEof {
            expected: 10,
            available: 4,
        };
        assert_eq!(e.kind(), ErrorKind::CorruptIndex);
        assert_eq!(FormatError::InvalidBTreeSignature.kind(), ErrorKind::CorruptIndex);
        assert_eq!(FormatError::InvalidCacheType(7).kind(), ErrorKind::CorruptIndex);
    }

    #[test]
    fn display_names_the_component() {
        let e = FormatError::NotFound("bar".into());
        assert_eq!(e.to_string(), "not found: bar");
        assert!(e.is_not_found());
    }
}

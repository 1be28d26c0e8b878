//! Error types for the file-level API.

use h5group_format::error::{ErrorKind, FormatError};

use crate::file::File;

/// Errors from opening, editing or flushing a file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Error from the group storage engine.
    #[error("HDF5 format error: {0}")]
    Format(#[from] FormatError),
    /// Another thread panicked while holding the file.
    #[error("file state poisoned by a panicking thread")]
    Poisoned,
    /// The file to mount is shared with other handles.
    #[error("file is still referenced by another handle")]
    Shared,
}

/// A failed [`Group::mount`](crate::Group::mount). The file that was to be
/// mounted is handed back untouched.
#[derive(Debug, thiserror::Error)]
#[error("mount failed: {error}")]
pub struct MountError {
    #[source]
    error: Error,
    child: File,
}

impl MountError {
    pub(crate) fn new(error: Error, child: File) -> Self {
        MountError { error, child }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The file that was not mounted.
    pub fn into_inner(self) -> File {
        self.child
    }

    pub fn into_parts(self) -> (Error, File) {
        (self.error, self.child)
    }
}

impl From<MountError> for Error {
    fn from(e: MountError) -> Error {
        e.error
    }
}

impl Error {
    /// Engine error category, if this came from the engine.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Format(e) => Some(e.kind()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::NotFound)
    }
}

use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `worldpack` crate.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// Normalizing a path (or a symlink target) would leave the root it is anchored to.
    #[error("path '{path}' escapes its root")]
    PathEscape { path: String },

    /// A single entry could not be read while walking or packing. Recoverable.
    #[error("cannot read '{}': {source}", path.display())]
    EntryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A block failed to decompress: truncated, bad checksum, or over the size bound.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// An entry's block could not be restored, or its content does not match the
    /// recorded checksum.
    #[error("entry '{path}' is corrupt: {reason}")]
    CorruptEntry { path: String, reason: String },

    /// The footer or index is malformed, or the format version is unsupported.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The operation was aborted through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller passed options that cannot be honoured.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A selection named a path that is not in the archive.
    #[error("'{0}' is not in the archive")]
    InvalidSelection(String),
}

impl ArchiverError {
    pub(crate) fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiverError::Io { source, path: path.into() }
    }

    /// Per-entry errors that a pipeline may skip according to its `ErrorPolicy`.
    /// Everything else aborts the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArchiverError::EntryUnreadable { .. }
                | ArchiverError::CorruptBlock(_)
                | ArchiverError::CorruptEntry { .. }
        )
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for ArchiverError {
    fn from(err: std::io::Error) -> Self {
        ArchiverError::Io { source: err, path: PathBuf::new() }
    }
}

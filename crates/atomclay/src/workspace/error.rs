//! Workspace error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Errors that can escape a workspace operation.
///
/// Per-entry failures during archive and cleanup are logged and counted in
/// the operation report instead; only the variants below reach the caller.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A workspace directory could not be created.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The archive root or the timestamped archive directory could not be created.
    #[error("failed to create archive directory {}: {source}", path.display())]
    ArchiveDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing a file into the workspace failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading a file from the workspace failed.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

//! Disk manager errors.

use std::io;
use std::path::PathBuf;

use keel_common::types::PageId;
use thiserror::Error;

/// Result type for disk manager operations.
pub type DiskResult<T> = Result<T, DiskError>;

/// Errors that can occur during disk I/O.
#[derive(Debug, Error)]
pub enum DiskError {
    /// I/O error from the underlying file.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: io::Error,
    },

    /// I/O error with the file path attached.
    #[error("I/O error on {path}: {source}")]
    IoAt {
        /// The file the operation targeted.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// Operation on an invalid page ID.
    #[error("invalid page ID: {page_id}")]
    InvalidPageId {
        /// The offending page id.
        page_id: PageId,
    },

    /// The disk manager has been shut down.
    #[error("disk manager is shut down")]
    Shutdown,
}

impl DiskError {
    /// Creates an I/O error carrying the file path.
    pub fn io_at(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }
}

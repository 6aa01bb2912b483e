//! Hash index errors.

use keel_common::types::PageId;
use thiserror::Error;

use crate::buffer::BufferError;

/// Result type for hash index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur during hash index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying buffer pool failure.
    #[error("buffer pool error: {0}")]
    Buffer(#[from] BufferError),

    /// The directory cannot hold enough block page ids for the requested
    /// bucket count.
    #[error("directory overflow: {required} blocks needed, header page holds {capacity}")]
    DirectoryFull {
        /// Blocks the bucket count requires.
        required: usize,
        /// Block ids one header page can hold.
        capacity: usize,
    },

    /// The page opened as a directory header fails validation.
    #[error("page {page_id} is not a valid index directory")]
    BadDirectory {
        /// The page id that was opened.
        page_id: PageId,
    },
}

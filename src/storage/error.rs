//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page not resident in buffer pool: {0}")]
    PageNotResident(PageId),

    #[error("Buffer pool is full: cannot admit {page_id} ({max_pages} pages resident)")]
    BufferPoolFull { page_id: PageId, max_pages: usize },

    #[error("Write out of page bounds: {page_id} offset {offset} length {len}")]
    OutOfBounds {
        page_id: PageId,
        offset: usize,
        len: usize,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

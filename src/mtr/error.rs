//! Mini-transaction error types.

use thiserror::Error;

use crate::redo::RedoError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum MtrError {
    #[error("Redo log error: {0}")]
    Redo(#[from] RedoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Checkpoint commit rejected: {0}")]
    CheckpointRejected(&'static str),
}

pub type MtrResult<T> = Result<T, MtrError>;

//! Redo log error types.

use thiserror::Error;

/// Errors reported by the global redo log and the record reader.
#[derive(Error, Debug)]
pub enum RedoError {
    #[error("Redo log full: {requested} bytes requested, {available} available before checkpoint")]
    LogFull { requested: usize, available: usize },

    #[error("Redo log halted after a fatal error; no further writes accepted")]
    Halted,

    #[error("Redo log bytes before {0} have been discarded")]
    Discarded(crate::redo::Lsn),

    #[error("Corrupt redo stream at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },

    #[error("Tablespace name for {space} is {len} bytes; a naming record holds at most {max}")]
    NameTooLong {
        space: crate::storage::SpaceId,
        len: usize,
        max: usize,
    },

    #[error("Unknown redo record type {0:#04x}")]
    UnknownRecordType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for redo log operations.
pub type RedoResult<T> = Result<T, RedoError>;

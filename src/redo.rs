//! Redo logging.
//!
//! This module provides:
//! - `Lsn`, the byte position in the redo stream
//! - the record-type table, record encoding and a stream parser that splits
//!   redo into mini-transactions
//! - `RedoLog`, the process-wide append target with LSN allocation, the
//!   append and flush-order locks, and the tablespace naming registry

pub mod error;
pub mod file;
pub mod global;
pub mod lsn;
pub mod record;

pub use error::{RedoError, RedoResult};
pub use global::{AppendGuard, FlushOrderGuard, LogStatistics, RedoLog, RedoLogConfig};
pub use lsn::Lsn;
pub use record::{
    parse_groups, parse_records, LogRecord, ParsedRecord, RecordType, MAX_RECORD_SIZE,
    MULTI_REC_END, SINGLE_REC_FLAG,
};

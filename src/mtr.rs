//! Mini-transactions.
//!
//! This module provides:
//! - `LogBuffer`, the local redo buffer of a mini-transaction
//! - `MemoStack` and its visitors, tracking the latches and fixes held
//! - `MiniTransaction`, the handle callers latch, modify and commit through
//! - the commit protocol that publishes local redo into the global log

mod commit;
pub mod error;
pub mod log_buffer;
pub mod memo;
pub mod mini_transaction;
pub mod state;

pub use error::{MtrError, MtrResult};
pub use log_buffer::{LogBuffer, LOG_BUFFER_BLOCK_SIZE};
pub use memo::{
    FindOne, MarkDirtyAndRegister, MemoKind, MemoObject, MemoSlot, MemoStack, MemoVisitor,
    ReleaseAll, ReleaseLatchesOnly,
};
pub use mini_transaction::MiniTransaction;
pub use state::{MtrLogMode, MtrState};

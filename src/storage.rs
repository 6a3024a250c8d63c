//! Storage layer the mini-transaction engine runs against.
//!
//! - **PageId / SpaceId**: page and tablespace identity
//! - **RwLatch**: explicit shared / shared-exclusive / exclusive latch
//! - **BufferPool**: in-memory page cache, latch manager and flush list
//!
//! Page images never reach disk here; the flush list only tracks which pages
//! a writer would have to flush, and the LSN range that dirtied them.

pub mod buffer;
pub mod error;
pub mod latch;
pub mod page;

pub use buffer::{BufferPool, BufferPoolConfig, RegistrationHook};
pub use error::{StorageError, StorageResult};
pub use latch::{LatchMode, RwLatchId};
pub use page::{PageId, SpaceId, PAGE_SIZE};

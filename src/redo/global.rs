//! The global redo log service.
//!
//! One `RedoLog` exists per process and is shared by reference with every
//! mini-transaction. It owns:
//! - the LSN counter and the in-memory log tail, behind the append lock
//! - the flush-order lock, which committing mini-transactions take before
//!   releasing the append lock so flush-list insertion follows LSN order
//! - the registry of tablespaces named since the last checkpoint
//! - an optional file the tail is written to by `write_up_to`

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::error::{RedoError, RedoResult};
use super::file::RedoFile;
use super::record::{LogRecord, MAX_RECORD_SIZE};
use super::Lsn;
use crate::mtr::LogBuffer;
use crate::storage::SpaceId;

/// Redo log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedoLogConfig {
    /// Maximum number of bytes between the checkpoint LSN and the current LSN.
    pub capacity: u64,
    /// Size of a log block. A mini-transaction whose bytes fit in the rest
    /// of the current block takes the fast append path.
    pub block_size: usize,
    /// File the log is written to, if any.
    pub log_path: Option<PathBuf>,
    /// Whether `write_up_to` syncs the file.
    pub sync_on_write: bool,
}

impl Default for RedoLogConfig {
    fn default() -> Self {
        RedoLogConfig {
            capacity: 64 * 1024 * 1024,
            block_size: 512,
            log_path: None,
            sync_on_write: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogStatistics {
    pub fast_appends: u64,
    pub slow_appends: u64,
    pub file_name_records: u64,
    pub checkpoints: u64,
}

/// Held by the append lock.
struct LogState {
    /// Next LSN to assign.
    lsn: Lsn,
    /// LSN of `buf[0]`.
    base_lsn: Lsn,
    buf: Vec<u8>,
    checkpoint_lsn: Lsn,
    /// Tablespaces that got a naming record since the last checkpoint.
    named_spaces: HashSet<SpaceId>,
    open_write: Option<OpenWrite>,
}

struct OpenWrite {
    start: Lsn,
    remaining: usize,
}

struct WriterState {
    file: Option<RedoFile>,
    written_lsn: Lsn,
}

pub struct RedoLog {
    config: RedoLogConfig,
    state: Mutex<LogState>,
    flush_order: Mutex<()>,
    writer: Mutex<WriterState>,
    /// Mirror of `LogState::lsn`, readable without the append lock.
    current_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    halted: AtomicBool,
    space_names: DashMap<SpaceId, String>,
    fast_appends: AtomicU64,
    slow_appends: AtomicU64,
    file_name_records: AtomicU64,
    checkpoints: AtomicU64,
}

/// Guard of the flush-order lock.
pub type FlushOrderGuard<'a> = MutexGuard<'a, ()>;

impl RedoLog {
    pub fn new(config: RedoLogConfig) -> RedoResult<Self> {
        let file = match &config.log_path {
            Some(path) => Some(RedoFile::create(path)?),
            None => None,
        };

        Ok(RedoLog {
            state: Mutex::new(LogState {
                lsn: Lsn::START,
                base_lsn: Lsn::START,
                buf: Vec::new(),
                checkpoint_lsn: Lsn::START,
                named_spaces: HashSet::new(),
                open_write: None,
            }),
            flush_order: Mutex::new(()),
            writer: Mutex::new(WriterState {
                file,
                written_lsn: Lsn::START,
            }),
            current_lsn: AtomicU64::new(Lsn::START.0),
            flushed_lsn: AtomicU64::new(Lsn::START.0),
            halted: AtomicBool::new(false),
            space_names: DashMap::new(),
            fast_appends: AtomicU64::new(0),
            slow_appends: AtomicU64::new(0),
            file_name_records: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            config,
        })
    }

    /// Take the append lock. Released when the guard drops.
    pub fn enter_append_lock(&self) -> AppendGuard<'_> {
        AppendGuard {
            log: self,
            state: self.state.lock(),
        }
    }

    /// Take the flush-order lock. Released when the guard drops.
    pub fn enter_flush_order_lock(&self) -> FlushOrderGuard<'_> {
        self.flush_order.lock()
    }

    /// Next LSN to be assigned. Does not take the append lock.
    pub fn lsn(&self) -> Lsn {
        Lsn(self.current_lsn.load(Ordering::SeqCst))
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.lock().checkpoint_lsn
    }

    /// Everything below this LSN has been handed to the log file.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &RedoLogConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Record the file path naming records for `space` should carry.
    ///
    /// Fails if the naming record would exceed `MAX_RECORD_SIZE`.
    pub fn register_tablespace(&self, space: SpaceId, name: impl Into<String>) -> RedoResult<()> {
        let name = name.into();
        let record_len = LogRecord::FileName {
            space,
            name: name.clone(),
        }
        .to_bytes()
        .len();
        if record_len > MAX_RECORD_SIZE {
            return Err(RedoError::NameTooLong {
                space,
                len: name.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        self.space_names.insert(space, name);
        Ok(())
    }

    pub fn tablespace_name(&self, space: SpaceId) -> String {
        self.space_names
            .get(&space)
            .map(|n| n.value().clone())
            .unwrap_or_else(|| format!("./space_{}.ibd", space.0))
    }

    /// Returns true if `space` got a naming record since the last checkpoint.
    pub fn is_space_named(&self, space: SpaceId) -> bool {
        self.state.lock().named_spaces.contains(&space)
    }

    /// Copy of the log bytes from `from` up to the current LSN.
    pub fn contents(&self, from: Lsn) -> RedoResult<Vec<u8>> {
        let state = self.state.lock();
        if from < state.base_lsn {
            return Err(RedoError::Discarded(state.base_lsn));
        }
        let start = (from.distance_from(state.base_lsn) as usize).min(state.buf.len());
        Ok(state.buf[start..].to_vec())
    }

    /// Write the log to its file up to at least `lsn`.
    ///
    /// Must not be called while holding the append lock.
    pub fn write_up_to(&self, lsn: Lsn) -> RedoResult<()> {
        if self.flushed_lsn() >= lsn {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        if writer.written_lsn >= lsn {
            return Ok(());
        }

        let (bytes, end_lsn) = {
            let state = self.state.lock();
            let start = writer.written_lsn.distance_from(state.base_lsn) as usize;
            (state.buf[start..].to_vec(), state.lsn)
        };

        if let Some(file) = writer.file.as_mut() {
            file.write(&bytes)?;
            file.flush()?;
            if self.config.sync_on_write {
                file.sync()?;
            }
        }

        writer.written_lsn = end_lsn;
        self.flushed_lsn.fetch_max(end_lsn.0, Ordering::SeqCst);
        log::trace!("redo written up to {}", end_lsn);
        Ok(())
    }

    pub fn stats(&self) -> LogStatistics {
        LogStatistics {
            fast_appends: self.fast_appends.load(Ordering::Relaxed),
            slow_appends: self.slow_appends.load(Ordering::Relaxed),
            file_name_records: self.file_name_records.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// Holder of the append lock.
///
/// All LSN allocation happens through this guard. Dropping it releases the
/// lock.
pub struct AppendGuard<'a> {
    log: &'a RedoLog,
    state: MutexGuard<'a, LogState>,
}

impl<'a> AppendGuard<'a> {
    pub fn log(&self) -> &'a RedoLog {
        self.log
    }

    pub fn lsn(&self) -> Lsn {
        self.state.lsn
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.checkpoint_lsn
    }

    fn available(&self) -> usize {
        let used = self.state.lsn.distance_from(self.state.checkpoint_lsn);
        self.log.config.capacity.saturating_sub(used) as usize
    }

    fn append(&mut self, bytes: &[u8]) {
        self.state.buf.extend_from_slice(bytes);
        self.state.lsn = self.state.lsn.advance(bytes.len());
        self.log.current_lsn.store(self.state.lsn.0, Ordering::SeqCst);
    }

    /// Append `bytes` in one step if they fit in the current log block.
    /// Returns the end LSN, or `None` if the caller must take the slow path.
    pub fn try_fast_append(&mut self, bytes: &[u8]) -> Option<Lsn> {
        debug_assert!(self.state.open_write.is_none());
        if bytes.is_empty() || self.log.is_halted() {
            return None;
        }

        let block_size = self.log.config.block_size as u64;
        let offset = self.state.lsn.0 % block_size;
        if offset + bytes.len() as u64 > block_size || bytes.len() > self.available() {
            return None;
        }

        self.append(bytes);
        self.log.fast_appends.fetch_add(1, Ordering::Relaxed);
        Some(self.state.lsn)
    }

    /// Reserve `len` bytes for a write spanning several `write` calls.
    /// Returns the start LSN.
    ///
    /// Running out of space halts the log: durability can no longer be
    /// guaranteed, so every later append fails.
    pub fn reserve_and_open(&mut self, len: usize) -> RedoResult<Lsn> {
        if self.log.is_halted() {
            return Err(RedoError::Halted);
        }
        debug_assert!(self.state.open_write.is_none(), "redo write already open");

        let available = self.available();
        if len > available {
            self.log.halt();
            log::error!(
                "redo log full at {}: {} bytes requested, {} available; halting",
                self.state.lsn,
                len,
                available
            );
            return Err(RedoError::LogFull {
                requested: len,
                available,
            });
        }

        let start = self.state.lsn;
        self.state.open_write = Some(OpenWrite {
            start,
            remaining: len,
        });
        Ok(start)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match self.state.open_write.as_mut() {
            Some(open) => {
                debug_assert!(bytes.len() <= open.remaining, "write past reservation");
                open.remaining = open.remaining.saturating_sub(bytes.len());
            }
            None => debug_assert!(false, "write without reserve_and_open"),
        }
        self.append(bytes);
    }

    /// Finish the open write. Returns the end LSN.
    pub fn close(&mut self) -> Lsn {
        let open = self.state.open_write.take();
        debug_assert!(
            matches!(&open, Some(o) if o.remaining == 0),
            "close without a fully written reservation"
        );
        if let Some(open) = open {
            log::trace!("slow append {}..{}", open.start, self.state.lsn);
        }
        self.log.slow_appends.fetch_add(1, Ordering::Relaxed);
        self.state.lsn
    }

    /// Append a naming record for `space` to `log_buffer` unless the space
    /// already got one since the last checkpoint. Returns whether a record
    /// was appended.
    pub fn emit_file_name_record(&mut self, space: SpaceId, log_buffer: &mut LogBuffer) -> bool {
        if space.is_predefined() || !self.state.named_spaces.insert(space) {
            return false;
        }

        let record = LogRecord::FileName {
            space,
            name: self.log.tablespace_name(space),
        };
        log_buffer.push(&record.to_bytes());
        self.log.file_name_records.fetch_add(1, Ordering::Relaxed);
        log::debug!("naming record for {} at {}", space, self.state.lsn);
        true
    }

    /// Move the checkpoint to `checkpoint_lsn`, forget which tablespaces were
    /// named and discard log bytes that are both checkpointed and written.
    pub fn advance_checkpoint(&mut self, checkpoint_lsn: Lsn) {
        debug_assert!(checkpoint_lsn >= self.state.checkpoint_lsn);
        debug_assert!(checkpoint_lsn <= self.state.lsn);

        self.state.checkpoint_lsn = checkpoint_lsn;
        self.state.named_spaces.clear();

        let discard_to = checkpoint_lsn.min(self.log.flushed_lsn());
        if discard_to > self.state.base_lsn {
            let n = discard_to.distance_from(self.state.base_lsn) as usize;
            self.state.buf.drain(..n);
            self.state.base_lsn = discard_to;
        }
        self.log.checkpoints.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::record::{parse_groups, SINGLE_REC_FLAG};
    use tempfile::TempDir;

    fn create_test_log(capacity: u64, block_size: usize) -> RedoLog {
        RedoLog::new(RedoLogConfig {
            capacity,
            block_size,
            log_path: None,
            sync_on_write: false,
        })
        .unwrap()
    }

    #[test]
    fn test_fast_append() {
        let log = create_test_log(1024 * 1024, 512);
        let mut guard = log.enter_append_lock();

        let start = guard.lsn();
        let end = guard.try_fast_append(&[1, 2, 3]).unwrap();
        assert_eq!(end, start.advance(3));
        drop(guard);

        assert_eq!(log.lsn(), end);
        assert_eq!(log.stats().fast_appends, 1);
    }

    #[test]
    fn test_fast_append_refuses_block_crossing() {
        let log = create_test_log(1024 * 1024, 16);
        let mut guard = log.enter_append_lock();

        // START is block aligned; 10 bytes leave 6 in the block.
        guard.try_fast_append(&[0; 10]).unwrap();
        assert!(guard.try_fast_append(&[0; 7]).is_none());

        let start = guard.reserve_and_open(7).unwrap();
        guard.write(&[0; 3]);
        guard.write(&[0; 4]);
        let end = guard.close();
        assert_eq!(end, start.advance(7));
        drop(guard);

        let stats = log.stats();
        assert_eq!(stats.fast_appends, 1);
        assert_eq!(stats.slow_appends, 1);
    }

    #[test]
    fn test_log_full_halts() {
        let log = create_test_log(8, 512);
        let mut guard = log.enter_append_lock();

        assert!(guard.try_fast_append(&[0; 9]).is_none());
        let err = guard.reserve_and_open(9).unwrap_err();
        assert!(matches!(
            err,
            RedoError::LogFull {
                requested: 9,
                available: 8
            }
        ));
        assert!(log.is_halted());

        // Nothing is accepted afterwards, even small writes.
        assert!(guard.try_fast_append(&[0]).is_none());
        assert!(matches!(guard.reserve_and_open(1), Err(RedoError::Halted)));
    }

    #[test]
    fn test_file_name_registry() {
        let log = create_test_log(1024 * 1024, 512);
        log.register_tablespace(SpaceId(7), "./db/t7.ibd").unwrap();
        let mut buffer = LogBuffer::new();

        let mut guard = log.enter_append_lock();
        assert!(guard.emit_file_name_record(SpaceId(7), &mut buffer));
        assert!(!guard.emit_file_name_record(SpaceId(7), &mut buffer));
        assert!(!guard.emit_file_name_record(SpaceId::SYSTEM, &mut buffer));
        drop(guard);

        assert!(log.is_space_named(SpaceId(7)));
        let (record, _) = LogRecord::decode(&buffer.to_vec()).unwrap();
        assert_eq!(
            record,
            LogRecord::FileName {
                space: SpaceId(7),
                name: "./db/t7.ibd".to_string()
            }
        );

        let mut guard = log.enter_append_lock();
        let lsn = guard.lsn();
        guard.advance_checkpoint(lsn);
        drop(guard);
        assert!(!log.is_space_named(SpaceId(7)));
    }

    #[test]
    fn test_overlong_tablespace_name_rejected() {
        let log = create_test_log(1024 * 1024, 512);
        let err = log
            .register_tablespace(SpaceId(8), "x".repeat(MAX_RECORD_SIZE))
            .unwrap_err();
        assert!(matches!(
            err,
            RedoError::NameTooLong {
                space: SpaceId(8),
                ..
            }
        ));
        // The space keeps its default name.
        assert_eq!(log.tablespace_name(SpaceId(8)), "./space_8.ibd");

        log.register_tablespace(SpaceId(8), "./db/t8.ibd").unwrap();
        assert_eq!(log.tablespace_name(SpaceId(8)), "./db/t8.ibd");
    }

    #[test]
    fn test_write_up_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("redo.log");
        let log = RedoLog::new(RedoLogConfig {
            log_path: Some(path.clone()),
            sync_on_write: false,
            ..Default::default()
        })
        .unwrap();

        let mut bytes = LogRecord::Checkpoint { lsn: Lsn(8192) }.to_bytes();
        bytes[0] |= SINGLE_REC_FLAG;
        let end = log.enter_append_lock().try_fast_append(&bytes).unwrap();
        assert_eq!(log.flushed_lsn(), Lsn::START);

        log.write_up_to(end).unwrap();
        assert_eq!(log.flushed_lsn(), end);

        let on_disk = RedoFile::read_all(&path).unwrap();
        assert_eq!(on_disk, bytes);
        assert_eq!(parse_groups(&on_disk).unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoint_discards_written_bytes() {
        let log = create_test_log(1024 * 1024, 512);
        let end = log.enter_append_lock().try_fast_append(&[0xAA; 8]).unwrap();

        // Not yet written: nothing can be discarded.
        log.enter_append_lock().advance_checkpoint(end);
        assert_eq!(log.contents(Lsn::START).unwrap().len(), 8);

        log.write_up_to(end).unwrap();
        log.enter_append_lock().advance_checkpoint(end);
        assert!(matches!(
            log.contents(Lsn::START),
            Err(RedoError::Discarded(lsn)) if lsn == end
        ));
        assert!(log.contents(end).unwrap().is_empty());
    }
}

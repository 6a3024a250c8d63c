//! Checkpointing.
//!
//! A checkpoint moves the point recovery would start from up to the oldest
//! modification still in the flush list, writes a checkpoint marker through a
//! mini-transaction and resets tablespace naming so the next modification of
//! each user tablespace logs a fresh naming record.

use parking_lot::Mutex;

use crate::mtr::{MiniTransaction, MtrError, MtrResult};
use crate::redo::{Lsn, RedoLog};
use crate::storage::BufferPool;

/// Outcome of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Recovery start point recorded in the marker.
    pub checkpoint_lsn: Lsn,
    /// End LSN of the marker itself.
    pub end_lsn: Lsn,
    /// Dirty pages at the time the checkpoint LSN was chosen.
    pub dirty_pages: usize,
}

#[derive(Debug)]
struct CheckpointState {
    last_checkpoint: Option<Checkpoint>,
    checkpoint_in_progress: bool,
}

/// Creates checkpoints against one redo log and buffer pool.
pub struct CheckpointManager<'a> {
    log: &'a RedoLog,
    pool: &'a BufferPool,
    state: Mutex<CheckpointState>,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(log: &'a RedoLog, pool: &'a BufferPool) -> Self {
        CheckpointManager {
            log,
            pool,
            state: Mutex::new(CheckpointState {
                last_checkpoint: None,
                checkpoint_in_progress: false,
            }),
        }
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.state.lock().last_checkpoint
    }

    /// Write the log, flush every page it covers, then checkpoint.
    pub fn flush_and_checkpoint(&self) -> MtrResult<Checkpoint> {
        self.log.write_up_to(self.log.lsn())?;
        let flushed = self.pool.flush_up_to(self.log.flushed_lsn());
        log::debug!("flushed {} pages before checkpoint", flushed);
        self.create_checkpoint()
    }

    /// Write a checkpoint marker and advance the checkpoint LSN.
    ///
    /// The checkpoint LSN is the oldest modification in the flush list, or
    /// the current LSN if no page is dirty, capped at what has been written.
    pub fn create_checkpoint(&self) -> MtrResult<Checkpoint> {
        {
            let mut state = self.state.lock();
            if state.checkpoint_in_progress {
                return Err(MtrError::CheckpointRejected("checkpoint already in progress"));
            }
            state.checkpoint_in_progress = true;
        }

        let result = self.write_checkpoint();

        let mut state = self.state.lock();
        state.checkpoint_in_progress = false;
        if let Ok(checkpoint) = result {
            state.last_checkpoint = Some(checkpoint);
        }
        result
    }

    fn write_checkpoint(&self) -> MtrResult<Checkpoint> {
        self.log.write_up_to(self.log.lsn())?;

        let mut guard = self.log.enter_append_lock();
        // A committer that dirties a clean page holds the flush-order lock
        // from before it drops the append lock until it has registered, so
        // that page is in the flush list once we get the lock. Pages already
        // dirty stay in the list while fixed, since `flush_up_to` skips them.
        let (oldest, dirty_pages) = {
            let _flush_order = self.log.enter_flush_order_lock();
            (
                self.pool.oldest_modification(),
                self.pool.flush_list_snapshot().len(),
            )
        };
        let checkpoint_lsn = oldest
            .unwrap_or_else(|| guard.lsn())
            .min(self.log.flushed_lsn())
            .max(guard.checkpoint_lsn());

        let mut mtr = MiniTransaction::start(self.log, self.pool, false, false);
        let end_lsn = mtr.commit_checkpoint(&mut guard, checkpoint_lsn)?;
        guard.advance_checkpoint(checkpoint_lsn);
        drop(guard);

        self.log.write_up_to(end_lsn)?;
        log::info!(
            "checkpoint at {} (marker ends at {}, {} dirty pages)",
            checkpoint_lsn,
            end_lsn,
            dirty_pages
        );
        Ok(Checkpoint {
            checkpoint_lsn,
            end_lsn,
            dirty_pages,
        })
    }
}

/// Take one checkpoint of `log` with a throwaway manager.
pub fn make_checkpoint(log: &RedoLog, pool: &BufferPool) -> MtrResult<Checkpoint> {
    CheckpointManager::new(log, pool).create_checkpoint()
}

//! The commit protocol.
//!
//! `CommitCoordinator` runs the steps of a logging commit in a fixed order:
//!
//! 1. take the append lock and frame the local records (`prepare_write`)
//! 2. copy them into the global log and learn the LSN range (`finish_write`)
//! 3. if a clean page was dirtied, take the flush-order lock, then drop the
//!    append lock
//! 4. register modified pages in the flush list (`release_blocks`)
//! 5. drop the flush-order lock, release latches, then fixes
//!
//! Holding the flush-order lock across the hand-off in step 3 is what keeps
//! the flush list ordered by `oldest_modification`: the next committer can
//! append, but cannot register its pages before this one has.

use super::error::MtrResult;
use super::log_buffer::LogBuffer;
use super::memo::{MarkDirtyAndRegister, ReleaseAll, ReleaseLatchesOnly};
use super::mini_transaction::MiniTransaction;
use super::state::MtrState;
use crate::redo::{AppendGuard, Lsn, MULTI_REC_END, SINGLE_REC_FLAG};

/// Close the record group in `buffer`: a lone record gets the single-record
/// flag on its type byte, several records get an end marker.
fn close_group(buffer: &mut LogBuffer, record_count: usize) {
    if record_count == 1 {
        if let Some(type_byte) = buffer.byte_at_mut(0) {
            *type_byte |= SINGLE_REC_FLAG;
        }
    } else {
        buffer.push(&[MULTI_REC_END]);
    }
}

pub(super) struct CommitCoordinator<'m, 'a> {
    mtr: &'m mut MiniTransaction<'a>,
    start_lsn: Lsn,
    end_lsn: Lsn,
}

impl<'m, 'a> CommitCoordinator<'m, 'a> {
    pub(super) fn new(mtr: &'m mut MiniTransaction<'a>) -> Self {
        debug_assert_eq!(mtr.state, MtrState::Committing);
        Self {
            mtr,
            start_lsn: Lsn::ZERO,
            end_lsn: Lsn::ZERO,
        }
    }

    /// Full commit of a mini-transaction that made modifications.
    pub(super) fn execute(&mut self) -> MtrResult<()> {
        let log = self.mtr.log;
        let mut guard = log.enter_append_lock();

        let len = self.prepare_write(&mut guard);
        if len > 0 {
            self.finish_write(&mut guard, len)?;
        }

        let flush_order = self.mtr.made_dirty.then(|| log.enter_flush_order_lock());
        drop(guard);

        self.mtr.commit_lsn = self.end_lsn;
        let registered = self.release_blocks();
        drop(flush_order);

        self.release_latches();
        self.release_resources();

        log::trace!(
            "mtr committed {}..{}: {} bytes, {} pages registered",
            self.start_lsn,
            self.end_lsn,
            len,
            registered
        );
        Ok(())
    }

    /// Frame the local records for the global log. Returns the number of
    /// bytes to append.
    ///
    /// Runs under the append lock, which is what makes the check for an
    /// earlier naming record of the modified tablespace race-free.
    fn prepare_write(&mut self, guard: &mut AppendGuard<'_>) -> usize {
        let mtr = &mut *self.mtr;
        if !mtr.mode.writes_redo() {
            debug_assert!(mtr.log_buffer.is_empty());
            self.start_lsn = guard.lsn();
            self.end_lsn = self.start_lsn;
            return 0;
        }
        debug_assert!(mtr.record_count > 0 && !mtr.log_buffer.is_empty());

        let record_count = mtr.record_count;
        if let Some(space) = mtr.modified_space.filter(|s| !s.is_predefined()) {
            let offset = mtr.log_buffer.len();
            if guard.emit_file_name_record(space, &mut mtr.log_buffer) {
                if mtr.named_space == Some(space) {
                    // This mini-transaction already carries a naming record
                    // for the space; keep only the type byte of the new one,
                    // rewritten as the end marker.
                    if let Some(type_byte) = mtr.log_buffer.byte_at_mut(offset) {
                        *type_byte = MULTI_REC_END;
                    }
                    mtr.log_buffer.truncate(offset + 1);
                    return mtr.log_buffer.len();
                }

                mtr.named_space.get_or_insert(space);
                mtr.record_count += 1;
                mtr.log_buffer.push(&[MULTI_REC_END]);
                return mtr.log_buffer.len();
            }
        }

        close_group(&mut mtr.log_buffer, record_count);
        mtr.log_buffer.len()
    }

    /// Copy the framed bytes into the global log, in one step when they fit
    /// the current log block and block by block otherwise.
    fn finish_write(&mut self, guard: &mut AppendGuard<'_>, len: usize) -> MtrResult<()> {
        let buffer = &self.mtr.log_buffer;
        debug_assert_eq!(buffer.len(), len);

        if buffer.is_single_block() {
            if let Some(block) = buffer.blocks().next() {
                if let Some(end) = guard.try_fast_append(block) {
                    self.end_lsn = end;
                    self.start_lsn = Lsn(end.0 - len as u64);
                    return Ok(());
                }
            }
        }

        self.start_lsn = guard.reserve_and_open(len)?;
        for block in buffer.blocks() {
            guard.write(block);
        }
        self.end_lsn = guard.close();
        debug_assert_eq!(self.end_lsn, self.start_lsn.advance(len));
        Ok(())
    }

    /// Register every page this mini-transaction modified in the flush list.
    fn release_blocks(&mut self) -> usize {
        let mtr = &mut *self.mtr;
        let mut mark = MarkDirtyAndRegister::new(mtr.pool, self.start_lsn, self.end_lsn);
        mtr.memo.visit_rev(&mut mark);
        mark.registered()
    }

    fn release_latches(&mut self) {
        let mtr = &mut *self.mtr;
        mtr.memo.visit_rev(&mut ReleaseLatchesOnly::new(mtr.pool));
    }

    pub(super) fn release_all(&mut self) {
        let mtr = &mut *self.mtr;
        mtr.memo.visit_rev(&mut ReleaseAll::new(mtr.pool));
    }

    /// Drop whatever fixes remain and reset the local buffers.
    pub(super) fn release_resources(&mut self) {
        self.release_all();
        let mtr = &mut *self.mtr;
        debug_assert!(
            mtr.memo.all_cleared(),
            "memo slot still holds its object after release"
        );
        mtr.memo.clear();
        mtr.log_buffer.clear();
        mtr.state = MtrState::Committed;
    }

    /// Append a checkpoint marker under the caller's append lock.
    pub(super) fn write_checkpoint(&mut self, guard: &mut AppendGuard<'_>) -> MtrResult<Lsn> {
        let len = {
            let mtr = &mut *self.mtr;
            close_group(&mut mtr.log_buffer, mtr.record_count);
            mtr.log_buffer.len()
        };
        self.finish_write(guard, len)?;

        self.mtr.commit_lsn = self.end_lsn;
        self.release_resources();
        log::debug!("checkpoint marker at {}..{}", self.start_lsn, self.end_lsn);
        Ok(self.end_lsn)
    }
}

//! The mini-transaction handle.
//!
//! A mini-transaction groups page modifications with the redo records that
//! describe them. It is owned by one thread: the caller latches pages
//! through it, modifies them, and commits. Commit appends the redo to the
//! global log, registers the modified pages in the flush list and releases
//! every latch in reverse acquisition order.

use byteorder::{BigEndian, ByteOrder};

use super::commit::CommitCoordinator;
use super::error::{MtrError, MtrResult};
use super::log_buffer::LogBuffer;
use super::memo::{FindOne, MemoKind, MemoObject, MemoStack, ReleaseAll};
use super::state::{MtrLogMode, MtrState};
use crate::redo::{AppendGuard, LogRecord, Lsn, RedoLog, MAX_RECORD_SIZE};
use crate::storage::{BufferPool, PageId, RwLatchId, SpaceId};

pub struct MiniTransaction<'a> {
    pub(super) log: &'a RedoLog,
    pub(super) pool: &'a BufferPool,
    pub(super) log_buffer: LogBuffer,
    pub(super) memo: MemoStack,
    pub(super) mode: MtrLogMode,
    pub(super) state: MtrState,
    /// Records appended to `log_buffer`.
    pub(super) record_count: usize,
    pub(super) made_modifications: bool,
    /// At least one page latched for modification was clean.
    pub(super) made_dirty: bool,
    /// First tablespace this mini-transaction wrote a naming record for.
    pub(super) named_space: Option<SpaceId>,
    /// The user tablespace this mini-transaction modifies.
    pub(super) modified_space: Option<SpaceId>,
    pub(super) commit_lsn: Lsn,
    sync: bool,
    read_only: bool,
    truncated: bool,
}

impl<'a> MiniTransaction<'a> {
    /// Start a mini-transaction against `log` and `pool`.
    ///
    /// A `sync` mini-transaction writes the redo log up to its commit LSN
    /// before `commit` returns. `read_only` promises that nothing will be
    /// modified.
    pub fn start(log: &'a RedoLog, pool: &'a BufferPool, sync: bool, read_only: bool) -> Self {
        Self {
            log,
            pool,
            log_buffer: LogBuffer::new(),
            memo: MemoStack::new(),
            mode: MtrLogMode::All,
            state: MtrState::Active,
            record_count: 0,
            made_modifications: false,
            made_dirty: false,
            named_space: None,
            modified_space: None,
            commit_lsn: Lsn::ZERO,
            sync,
            read_only,
            truncated: false,
        }
    }

    /// Reinitialize a committed handle for a new operation.
    pub fn restart(&mut self, sync: bool, read_only: bool) {
        debug_assert_ne!(
            self.state,
            MtrState::Active,
            "restart of an active mini-transaction"
        );
        debug_assert!(self.memo.is_empty() && self.log_buffer.is_empty());

        self.log_buffer.clear();
        self.memo.clear();
        self.mode = MtrLogMode::All;
        self.state = MtrState::Active;
        self.record_count = 0;
        self.made_modifications = false;
        self.made_dirty = false;
        self.named_space = None;
        self.modified_space = None;
        self.commit_lsn = Lsn::ZERO;
        self.sync = sync;
        self.read_only = read_only;
        self.truncated = false;
    }

    fn assert_active(&self, op: &str) {
        debug_assert_eq!(
            self.state,
            MtrState::Active,
            "{} on a mini-transaction that is not active",
            op
        );
    }

    pub fn state(&self) -> MtrState {
        self.state
    }

    pub fn log_mode(&self) -> MtrLogMode {
        self.mode
    }

    /// Change the logging mode. Returns the previous mode.
    pub fn set_log_mode(&mut self, mode: MtrLogMode) -> MtrLogMode {
        self.assert_active("set_log_mode");
        std::mem::replace(&mut self.mode, mode)
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn made_modifications(&self) -> bool {
        self.made_modifications
    }

    pub fn made_dirty(&self) -> bool {
        self.made_dirty
    }

    pub fn named_space(&self) -> Option<SpaceId> {
        self.named_space
    }

    pub fn modified_space(&self) -> Option<SpaceId> {
        self.modified_space
    }

    /// End LSN of the committed redo; `Lsn::ZERO` until a logging commit.
    pub fn commit_lsn(&self) -> Lsn {
        self.commit_lsn
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if a record was refused for exceeding `MAX_RECORD_SIZE`.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log_buffer
    }

    pub fn memo(&self) -> &MemoStack {
        &self.memo
    }

    pub fn set_modified(&mut self) {
        self.assert_active("set_modified");
        self.made_modifications = true;
    }

    /// Note that this mini-transaction modifies `space`. Predefined spaces
    /// are ignored; only one user tablespace may be modified.
    pub fn set_modified_space(&mut self, space: SpaceId) {
        if space.is_predefined() {
            return;
        }
        match self.modified_space {
            None => self.modified_space = Some(space),
            Some(existing) => debug_assert_eq!(
                existing, space,
                "a mini-transaction may modify only one user tablespace"
            ),
        }
    }

    /// Append one encoded redo record.
    ///
    /// Callers must keep records within `MAX_RECORD_SIZE`; a larger record is
    /// dropped and the mini-transaction is marked truncated. In the
    /// `NoRedo` and `None` modes the bytes are discarded.
    pub fn record(&mut self, bytes: &[u8]) {
        self.assert_active("record");
        debug_assert!(!self.read_only, "record in a read-only mini-transaction");
        debug_assert!(!bytes.is_empty());

        if bytes.len() > MAX_RECORD_SIZE {
            log::warn!(
                "redo record of {} bytes exceeds {}; mini-transaction truncated",
                bytes.len(),
                MAX_RECORD_SIZE
            );
            self.truncated = true;
            return;
        }

        self.made_modifications = true;
        if !self.mode.writes_redo() {
            return;
        }
        self.log_buffer.push(bytes);
        self.record_count += 1;
    }

    pub fn log_record(&mut self, record: &LogRecord) {
        self.record(&record.to_bytes());
    }

    /// Record that `object` is now held in `kind`. The latch or fix must
    /// already have been acquired.
    pub fn push_memo(&mut self, object: MemoObject, kind: MemoKind) {
        self.assert_active("push_memo");
        if let MemoObject::Page(page_id) = object {
            if kind.marks_dirty() && self.pool.is_clean(page_id) {
                self.made_dirty = true;
            }
        }
        self.memo.push(object, kind);
    }

    /// Release the most recent slot holding `object` in `kind` right away.
    ///
    /// Used to drop an ancestor latch during latch-coupled descent. Once
    /// this mini-transaction has modified anything, slots that register
    /// their page at commit (X-fixed, SX-fixed and modify marks) are kept
    /// until commit and this returns false.
    pub fn release_one(&mut self, object: MemoObject, kind: MemoKind) -> bool {
        self.assert_active("release_one");
        if self.made_modifications && kind.marks_dirty() {
            log::debug!(
                "refusing early release of {:?} held as {:?} after modification",
                object,
                kind
            );
            return false;
        }

        let mut find = FindOne::releasing(object, kind, self.pool);
        self.memo.visit_rev(&mut find);
        find.found()
    }

    /// Returns true if this mini-transaction holds `object` in `kind`.
    pub fn memo_contains(&mut self, object: MemoObject, kind: MemoKind) -> bool {
        let mut find = FindOne::new(object, kind);
        self.memo.visit_rev(&mut find);
        find.found()
    }

    fn holds_page_latch(&self, page_id: PageId) -> bool {
        self.memo
            .slots()
            .any(|s| s.page_id() == Some(page_id) && s.kind().latch_mode().is_some())
    }

    fn can_modify(&self, page_id: PageId) -> bool {
        self.memo.slots().any(|s| {
            s.page_id() == Some(page_id)
                && matches!(
                    s.kind(),
                    MemoKind::PageXFix | MemoKind::PageSxFix | MemoKind::ModifyMark
                )
        })
    }

    fn latch_page(&mut self, page_id: PageId, kind: MemoKind) -> MtrResult<()> {
        self.assert_active("latch_page");
        debug_assert!(
            !self.read_only || matches!(kind, MemoKind::PageSFix | MemoKind::BufFix),
            "read-only mini-transaction latching {} for modification",
            page_id
        );
        debug_assert!(
            kind == MemoKind::BufFix || !self.holds_page_latch(page_id),
            "{} latched twice in one mini-transaction",
            page_id
        );

        match kind.latch_mode() {
            Some(mode) => {
                self.pool.acquire_latch(page_id, mode)?;
            }
            None => self.pool.fix(page_id)?,
        }
        self.push_memo(MemoObject::Page(page_id), kind);
        Ok(())
    }

    pub fn buf_fix_page(&mut self, page_id: PageId) -> MtrResult<()> {
        self.latch_page(page_id, MemoKind::BufFix)
    }

    pub fn s_latch_page(&mut self, page_id: PageId) -> MtrResult<()> {
        self.latch_page(page_id, MemoKind::PageSFix)
    }

    pub fn sx_latch_page(&mut self, page_id: PageId) -> MtrResult<()> {
        self.latch_page(page_id, MemoKind::PageSxFix)
    }

    pub fn x_latch_page(&mut self, page_id: PageId) -> MtrResult<()> {
        self.latch_page(page_id, MemoKind::PageXFix)
    }

    fn lock(&mut self, id: RwLatchId, kind: MemoKind) {
        self.assert_active("lock");
        if let Some(mode) = kind.latch_mode() {
            self.pool.lock(id, mode);
            self.push_memo(MemoObject::Lock(id), kind);
        }
    }

    pub fn s_lock(&mut self, id: RwLatchId) {
        self.lock(id, MemoKind::SLock)
    }

    pub fn sx_lock(&mut self, id: RwLatchId) {
        self.lock(id, MemoKind::SxLock)
    }

    pub fn x_lock(&mut self, id: RwLatchId) {
        self.lock(id, MemoKind::XLock)
    }

    /// Flag a buffer-fixed page as modified without a latch of its own, so
    /// commit registers it in the flush list.
    pub fn memo_modify_page(&mut self, page_id: PageId) {
        debug_assert!(
            self.memo.slots().any(|s| s.page_id() == Some(page_id)
                && s.kind().is_page_fix()),
            "{} marked modified without being fixed",
            page_id
        );
        self.set_modified();
        self.push_memo(MemoObject::Page(page_id), MemoKind::ModifyMark);
    }

    /// Apply a page record to its page image and log it.
    fn apply(&mut self, record: LogRecord) -> MtrResult<()> {
        self.assert_active("write");
        let Some((page_id, offset, bytes)) = record.page_write() else {
            return Ok(());
        };
        debug_assert!(
            self.can_modify(page_id),
            "{} modified without an SX or X latch",
            page_id
        );

        self.pool.write_page(page_id, offset, &bytes)?;
        self.set_modified_space(page_id.space);
        self.log_record(&record);
        Ok(())
    }

    pub fn write_u8(&mut self, page_id: PageId, offset: u16, value: u8) -> MtrResult<()> {
        self.apply(LogRecord::Write1 {
            page_id,
            offset,
            value,
        })
    }

    pub fn write_u16(&mut self, page_id: PageId, offset: u16, value: u16) -> MtrResult<()> {
        self.apply(LogRecord::Write2 {
            page_id,
            offset,
            value,
        })
    }

    pub fn write_u32(&mut self, page_id: PageId, offset: u16, value: u32) -> MtrResult<()> {
        self.apply(LogRecord::Write4 {
            page_id,
            offset,
            value,
        })
    }

    pub fn write_u64(&mut self, page_id: PageId, offset: u16, value: u64) -> MtrResult<()> {
        self.apply(LogRecord::Write8 {
            page_id,
            offset,
            value,
        })
    }

    pub fn write_string(&mut self, page_id: PageId, offset: u16, data: &[u8]) -> MtrResult<()> {
        self.apply(LogRecord::WriteString {
            page_id,
            offset,
            data: data.to_vec(),
        })
    }

    pub fn read_u32(&self, page_id: PageId, offset: u16) -> MtrResult<u32> {
        let bytes = self.pool.read_page(page_id, offset as usize, 4)?;
        Ok(BigEndian::read_u32(&bytes))
    }

    /// Log a naming record for `space`, as file operations on it do.
    pub fn write_file_name(&mut self, space: SpaceId) {
        let record = LogRecord::FileName {
            space,
            name: self.log.tablespace_name(space),
        };
        self.log_record(&record);
        if self.mode.writes_redo() && self.named_space.is_none() {
            self.named_space = Some(space);
        }
    }

    /// Commit: append the redo, register dirtied pages in the flush list and
    /// release everything held.
    ///
    /// A mini-transaction that modified nothing, or logged nothing outside
    /// `NoRedo` mode, only releases its latches. An error means the redo log
    /// could not take the records; the log is halted and the latches of this
    /// mini-transaction are kept.
    pub fn commit(&mut self) -> MtrResult<()> {
        self.assert_active("commit");
        if self.state != MtrState::Active {
            return Ok(());
        }
        debug_assert!(!self.truncated, "commit of a truncated mini-transaction");

        self.state = MtrState::Committing;
        let write_log =
            self.made_modifications && (self.record_count > 0 || self.mode == MtrLogMode::NoRedo);

        let mut coordinator = CommitCoordinator::new(self);
        if write_log {
            coordinator.execute()?;
        } else {
            coordinator.release_all();
            coordinator.release_resources();
        }

        if write_log && self.sync {
            self.log.write_up_to(self.commit_lsn)?;
        }
        Ok(())
    }

    /// Commit a checkpoint marker carrying `checkpoint_lsn`.
    ///
    /// The caller holds the append lock through `guard`. Nothing may be in
    /// the memo and the mode must be `All`. Returns the end LSN of the marker.
    pub fn commit_checkpoint(
        &mut self,
        guard: &mut AppendGuard<'_>,
        checkpoint_lsn: Lsn,
    ) -> MtrResult<Lsn> {
        self.assert_active("commit_checkpoint");
        debug_assert!(
            std::ptr::eq(guard.log(), self.log),
            "append lock of another redo log"
        );
        if !self.memo.is_empty() {
            return Err(MtrError::CheckpointRejected("memo is not empty"));
        }
        if self.mode != MtrLogMode::All {
            return Err(MtrError::CheckpointRejected("log mode is not All"));
        }

        self.log_record(&LogRecord::Checkpoint {
            lsn: checkpoint_lsn,
        });
        self.state = MtrState::Committing;
        CommitCoordinator::new(self).write_checkpoint(guard)
    }
}

impl Drop for MiniTransaction<'_> {
    fn drop(&mut self) {
        match self.state {
            MtrState::Committed => {}
            MtrState::Active => {
                if self.made_modifications && !std::thread::panicking() {
                    log::error!("mini-transaction dropped with uncommitted modifications");
                    debug_assert!(false, "mini-transaction dropped before commit");
                }
                self.memo.visit_rev(&mut ReleaseAll::new(self.pool));
                self.memo.clear();
                self.log_buffer.clear();
            }
            MtrState::Committing => {
                log::error!(
                    "mini-transaction dropped after a failed commit; {} latches kept",
                    self.memo.held()
                );
            }
        }
    }
}

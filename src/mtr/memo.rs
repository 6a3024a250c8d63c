//! The memo: what a mini-transaction currently holds.
//!
//! Every latch and buffer-fix a mini-transaction takes is pushed as a
//! `MemoSlot`. Slots are released last-in first-out: a latch may have been
//! acquired only because an earlier one was held, so releasing in any other
//! order can expose a page that is still being modified.
//!
//! All passes over the memo go through `MemoStack::visit_rev` with a
//! `MemoVisitor` deciding what to do with each slot.

use std::ops::ControlFlow;

use crate::redo::Lsn;
use crate::storage::{BufferPool, LatchMode, PageId, RwLatchId};

/// Slots per memo block.
const MEMO_BLOCK_SLOTS: usize = 16;

/// What a memo slot holds on its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoKind {
    /// Page pinned without a latch.
    BufFix,
    PageSFix,
    PageXFix,
    PageSxFix,
    SLock,
    XLock,
    SxLock,
    /// A buffer-fixed page modified without a latch of its own.
    ModifyMark,
}

impl MemoKind {
    pub fn is_page_fix(&self) -> bool {
        matches!(
            self,
            Self::BufFix | Self::PageSFix | Self::PageXFix | Self::PageSxFix
        )
    }

    /// Latch mode held by this slot, if any.
    pub fn latch_mode(&self) -> Option<LatchMode> {
        match self {
            Self::PageSFix | Self::SLock => Some(LatchMode::Shared),
            Self::PageSxFix | Self::SxLock => Some(LatchMode::SharedExclusive),
            Self::PageXFix | Self::XLock => Some(LatchMode::Exclusive),
            Self::BufFix | Self::ModifyMark => None,
        }
    }

    /// Slots whose page must be registered in the flush list at commit.
    pub fn marks_dirty(&self) -> bool {
        matches!(self, Self::PageXFix | Self::PageSxFix | Self::ModifyMark)
    }
}

/// Object a slot refers to. The buffer pool owns the object itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoObject {
    Page(PageId),
    Lock(RwLatchId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoSlot {
    object: Option<MemoObject>,
    kind: MemoKind,
}

impl MemoSlot {
    pub fn object(&self) -> Option<MemoObject> {
        self.object
    }

    pub fn kind(&self) -> MemoKind {
        self.kind
    }

    pub fn is_cleared(&self) -> bool {
        self.object.is_none()
    }

    pub fn page_id(&self) -> Option<PageId> {
        match self.object {
            Some(MemoObject::Page(page_id)) => Some(page_id),
            _ => None,
        }
    }

    fn matches(&self, object: MemoObject, kind: MemoKind) -> bool {
        self.object == Some(object) && self.kind == kind
    }
}

#[derive(Debug)]
struct MemoBlock {
    slots: Vec<MemoSlot>,
}

impl MemoBlock {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MEMO_BLOCK_SLOTS),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoStack {
    blocks: Vec<MemoBlock>,
    len: usize,
}

impl MemoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: MemoObject, kind: MemoKind) {
        let need_block = self
            .blocks
            .last()
            .map_or(true, |b| b.slots.len() == MEMO_BLOCK_SLOTS);
        if need_block {
            self.blocks.push(MemoBlock::new());
        }
        if let Some(block) = self.blocks.last_mut() {
            block.slots.push(MemoSlot {
                object: Some(object),
                kind,
            });
            self.len += 1;
        }
    }

    /// Number of slots pushed, cleared or not.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots from first pushed to last.
    pub fn slots(&self) -> impl Iterator<Item = &MemoSlot> {
        self.blocks.iter().flat_map(|b| b.slots.iter())
    }

    /// Number of slots still holding their object.
    pub fn held(&self) -> usize {
        self.slots().filter(|s| !s.is_cleared()).count()
    }

    pub fn all_cleared(&self) -> bool {
        self.slots().all(|s| s.is_cleared())
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Visit every held slot from the most recently pushed to the first.
    ///
    /// Returns false if the visitor stopped the traversal early.
    pub fn visit_rev(&mut self, visitor: &mut dyn MemoVisitor) -> bool {
        for block in self.blocks.iter_mut().rev() {
            for slot in block.slots.iter_mut().rev() {
                if slot.is_cleared() {
                    continue;
                }
                if visitor.visit(slot).is_break() {
                    return false;
                }
            }
        }
        true
    }
}

/// Action applied to each held memo slot.
pub trait MemoVisitor {
    fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()>;
}

fn release_slot(pool: &BufferPool, slot: &mut MemoSlot) {
    let Some(object) = slot.object.take() else {
        return;
    };
    match (object, slot.kind.latch_mode()) {
        (MemoObject::Page(page_id), Some(mode)) => {
            pool.release_latch(page_id, mode);
            pool.release_fix(page_id);
        }
        (MemoObject::Page(page_id), None) => {
            if slot.kind == MemoKind::BufFix {
                pool.release_fix(page_id);
            }
        }
        (MemoObject::Lock(id), Some(mode)) => pool.unlock(id, mode),
        (MemoObject::Lock(id), None) => {
            debug_assert!(false, "memo slot {:?} on {} holds nothing", slot.kind, id);
        }
    }
}

/// Releases latches but keeps pages buffer-fixed.
///
/// A latched page slot becomes a `BufFix` slot; a later `ReleaseAll` drops
/// the fix.
pub struct ReleaseLatchesOnly<'a> {
    pool: &'a BufferPool,
}

impl<'a> ReleaseLatchesOnly<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self { pool }
    }
}

impl MemoVisitor for ReleaseLatchesOnly<'_> {
    fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()> {
        match (slot.object, slot.kind.latch_mode()) {
            (Some(MemoObject::Page(page_id)), Some(mode)) => {
                self.pool.release_latch(page_id, mode);
                slot.kind = MemoKind::BufFix;
            }
            (Some(MemoObject::Lock(id)), Some(mode)) => {
                self.pool.unlock(id, mode);
                slot.object = None;
            }
            _ if slot.kind == MemoKind::ModifyMark => slot.object = None,
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Releases latches and buffer-fixes.
pub struct ReleaseAll<'a> {
    pool: &'a BufferPool,
}

impl<'a> ReleaseAll<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self { pool }
    }
}

impl MemoVisitor for ReleaseAll<'_> {
    fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()> {
        release_slot(self.pool, slot);
        ControlFlow::Continue(())
    }
}

/// Registers every page modified under this mini-transaction in the flush
/// list with the commit's LSN range. Releases nothing.
pub struct MarkDirtyAndRegister<'a> {
    pool: &'a BufferPool,
    start_lsn: Lsn,
    end_lsn: Lsn,
    registered: usize,
}

impl<'a> MarkDirtyAndRegister<'a> {
    pub fn new(pool: &'a BufferPool, start_lsn: Lsn, end_lsn: Lsn) -> Self {
        Self {
            pool,
            start_lsn,
            end_lsn,
            registered: 0,
        }
    }

    pub fn registered(&self) -> usize {
        self.registered
    }
}

impl MemoVisitor for MarkDirtyAndRegister<'_> {
    fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()> {
        if slot.kind.marks_dirty() {
            if let Some(page_id) = slot.page_id() {
                self.pool
                    .note_modification(page_id, self.start_lsn, self.end_lsn);
                self.registered += 1;
            }
        }
        ControlFlow::Continue(())
    }
}

/// Stops at the most recent slot holding `object` in `kind`, optionally
/// releasing it.
pub struct FindOne<'a> {
    object: MemoObject,
    kind: MemoKind,
    release: Option<&'a BufferPool>,
    found: bool,
}

impl<'a> FindOne<'a> {
    pub fn new(object: MemoObject, kind: MemoKind) -> Self {
        Self {
            object,
            kind,
            release: None,
            found: false,
        }
    }

    pub fn releasing(object: MemoObject, kind: MemoKind, pool: &'a BufferPool) -> Self {
        Self {
            object,
            kind,
            release: Some(pool),
            found: false,
        }
    }

    pub fn found(&self) -> bool {
        self.found
    }
}

impl MemoVisitor for FindOne<'_> {
    fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()> {
        if !slot.matches(self.object, self.kind) {
            return ControlFlow::Continue(());
        }
        if let Some(pool) = self.release {
            release_slot(pool, slot);
        }
        self.found = true;
        ControlFlow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BufferPoolConfig;
    use rand::Rng;

    fn page(n: u32) -> PageId {
        PageId::new(1, n)
    }

    fn latch_into(pool: &BufferPool, memo: &mut MemoStack, object: MemoObject, kind: MemoKind) {
        match object {
            MemoObject::Page(page_id) => match kind.latch_mode() {
                Some(mode) => {
                    pool.acquire_latch(page_id, mode).unwrap();
                }
                None if kind == MemoKind::BufFix => pool.fix(page_id).unwrap(),
                None => {}
            },
            MemoObject::Lock(id) => pool.lock(id, kind.latch_mode().unwrap()),
        }
        memo.push(object, kind);
    }

    /// Records the order slots are visited in.
    struct Trace(Vec<MemoObject>);

    impl MemoVisitor for Trace {
        fn visit(&mut self, slot: &mut MemoSlot) -> ControlFlow<()> {
            self.0.extend(slot.object());
            ControlFlow::Continue(())
        }
    }

    #[test]
    fn test_visit_is_lifo_across_blocks() {
        let mut memo = MemoStack::new();
        let n = MEMO_BLOCK_SLOTS as u32 * 2 + 3;
        for i in 0..n {
            memo.push(MemoObject::Page(page(i)), MemoKind::BufFix);
        }
        assert_eq!(memo.len(), n as usize);

        let mut trace = Trace(Vec::new());
        assert!(memo.visit_rev(&mut trace));
        let expected: Vec<MemoObject> = (0..n).rev().map(|i| MemoObject::Page(page(i))).collect();
        assert_eq!(trace.0, expected);
    }

    #[test]
    fn test_release_all_clears_every_slot() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let mut memo = MemoStack::new();

        latch_into(&pool, &mut memo, MemoObject::Lock(RwLatchId(1)), MemoKind::SxLock);
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::PageXFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(2)), MemoKind::PageSFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(3)), MemoKind::BufFix);

        memo.visit_rev(&mut ReleaseAll::new(&pool));

        assert!(memo.all_cleared());
        assert!(!pool.is_locked(RwLatchId(1)));
        for n in 1..=3 {
            assert!(!pool.is_latched(page(n)));
            assert_eq!(pool.fix_count(page(n)), 0);
        }
    }

    #[test]
    fn test_release_latches_keeps_fixes() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let mut memo = MemoStack::new();

        latch_into(&pool, &mut memo, MemoObject::Lock(RwLatchId(4)), MemoKind::XLock);
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::PageXFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::ModifyMark);

        memo.visit_rev(&mut ReleaseLatchesOnly::new(&pool));

        assert!(!pool.is_locked(RwLatchId(4)));
        assert!(!pool.is_latched(page(1)));
        assert_eq!(pool.fix_count(page(1)), 1);
        assert_eq!(memo.held(), 1);
        let kinds: Vec<MemoKind> = memo
            .slots()
            .filter(|s| !s.is_cleared())
            .map(|s| s.kind())
            .collect();
        assert_eq!(kinds, vec![MemoKind::BufFix]);

        memo.visit_rev(&mut ReleaseAll::new(&pool));
        assert!(memo.all_cleared());
        assert_eq!(pool.fix_count(page(1)), 0);
    }

    #[test]
    fn test_random_sequences_always_clear() {
        let kinds = [
            MemoKind::BufFix,
            MemoKind::PageSFix,
            MemoKind::PageXFix,
            MemoKind::PageSxFix,
            MemoKind::SLock,
            MemoKind::XLock,
            MemoKind::SxLock,
        ];
        let mut rng = rand::thread_rng();

        for round in 0..50 {
            let pool = BufferPool::new(BufferPoolConfig::default());
            let mut memo = MemoStack::new();
            let n = rng.gen_range(1..60u32);
            // Distinct objects per slot, so no latch is taken twice.
            for i in 0..n {
                let kind = kinds[rng.gen_range(0..kinds.len())];
                let object = if kind.is_page_fix() {
                    MemoObject::Page(page(i))
                } else {
                    MemoObject::Lock(RwLatchId(i))
                };
                latch_into(&pool, &mut memo, object, kind);
            }

            if round % 2 == 0 {
                memo.visit_rev(&mut ReleaseLatchesOnly::new(&pool));
            }
            memo.visit_rev(&mut ReleaseAll::new(&pool));

            assert!(memo.all_cleared());
            for i in 0..n {
                assert!(!pool.is_latched(page(i)));
                assert_eq!(pool.fix_count(page(i)), 0);
                assert!(!pool.is_locked(RwLatchId(i)));
            }
        }
    }

    #[test]
    fn test_find_one_stops_at_most_recent() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let mut memo = MemoStack::new();
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::BufFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::BufFix);
        assert_eq!(pool.fix_count(page(1)), 2);

        let mut find = FindOne::new(MemoObject::Page(page(1)), MemoKind::PageSFix);
        assert!(memo.visit_rev(&mut find));
        assert!(!find.found());

        let mut find = FindOne::releasing(MemoObject::Page(page(1)), MemoKind::BufFix, &pool);
        assert!(!memo.visit_rev(&mut find));
        assert!(find.found());
        assert_eq!(pool.fix_count(page(1)), 1);

        // The newer slot was the one released.
        let cleared: Vec<bool> = memo.slots().map(|s| s.is_cleared()).collect();
        assert_eq!(cleared, vec![false, true]);

        memo.visit_rev(&mut ReleaseAll::new(&pool));
    }

    #[test]
    fn test_mark_dirty_and_register() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let mut memo = MemoStack::new();
        latch_into(&pool, &mut memo, MemoObject::Page(page(1)), MemoKind::PageXFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(2)), MemoKind::PageSFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(3)), MemoKind::PageSxFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(4)), MemoKind::BufFix);
        latch_into(&pool, &mut memo, MemoObject::Page(page(4)), MemoKind::ModifyMark);

        let mut mark = MarkDirtyAndRegister::new(&pool, Lsn(9000), Lsn(9040));
        memo.visit_rev(&mut mark);
        assert_eq!(mark.registered(), 3);

        assert!(!pool.is_clean(page(1)));
        assert!(pool.is_clean(page(2)));
        assert!(!pool.is_clean(page(3)));
        assert!(!pool.is_clean(page(4)));
        // Nothing was released.
        assert!(pool.is_latched(page(1)));
        assert_eq!(memo.held(), 5);

        memo.visit_rev(&mut ReleaseAll::new(&pool));
        assert!(memo.all_cleared());
    }
}

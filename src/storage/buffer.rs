pub mod flush_list;

use crate::redo::Lsn;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::latch::{LatchMode, RwLatch, RwLatchId};
use crate::storage::{PageId, PAGE_SIZE};
use dashmap::DashMap;
use flush_list::{FlushList, FlushListEntry, Registration};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Callback run at the start of every `note_modification`, before the flush
/// list is locked.
pub type RegistrationHook = Arc<dyn Fn(PageId) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of resident pages.
    pub max_pages: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig { max_pages: 1024 }
    }
}

struct PageFrame {
    latch: RwLatch,
    fix_count: AtomicU32,
    // 0 while the page is clean
    oldest_modification: AtomicU64,
    newest_modification: AtomicU64,
    data: Mutex<Box<[u8; PAGE_SIZE]>>,
}

impl PageFrame {
    fn new() -> Self {
        Self {
            latch: RwLatch::new(),
            fix_count: AtomicU32::new(0),
            oldest_modification: AtomicU64::new(0),
            newest_modification: AtomicU64::new(0),
            data: Mutex::new(Box::new([0u8; PAGE_SIZE])),
        }
    }
}

/// In-memory page cache and latch manager.
///
/// Pages become resident on their first fix and stay resident; a page is
/// "fixed" (pinned) by a fix count and "latched" by its rw-latch, and both are
/// released explicitly by the caller.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, Arc<PageFrame>>,
    rw_latches: DashMap<RwLatchId, Arc<RwLatch>>,
    flush_list: Mutex<FlushList>,
    registration_hook: RwLock<Option<RegistrationHook>>,
    config: BufferPoolConfig,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::with_capacity(config.max_pages),
                rw_latches: DashMap::new(),
                flush_list: Mutex::new(FlushList::new()),
                registration_hook: RwLock::new(None),
                config,
            }),
        }
    }

    fn frame(&self, page_id: PageId) -> StorageResult<Arc<PageFrame>> {
        self.inner
            .page_table
            .get(&page_id)
            .map(|e| e.value().clone())
            .ok_or(StorageError::PageNotResident(page_id))
    }

    /// Buffer-fix a page, making it resident if needed.
    pub fn fix(&self, page_id: PageId) -> StorageResult<()> {
        if let Some(frame) = self.inner.page_table.get(&page_id) {
            frame.fix_count.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        if self.inner.page_table.len() >= self.inner.config.max_pages {
            return Err(StorageError::BufferPoolFull {
                page_id,
                max_pages: self.inner.config.max_pages,
            });
        }

        let frame = self
            .inner
            .page_table
            .entry(page_id)
            .or_insert_with(|| Arc::new(PageFrame::new()));
        frame.fix_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Fix a page and latch it in `mode`. Blocks while the latch is held in
    /// an incompatible mode.
    pub fn acquire_latch(&self, page_id: PageId, mode: LatchMode) -> StorageResult<PageId> {
        self.fix(page_id)?;
        // Never block while holding a page table shard.
        let frame = self.frame(page_id)?;
        frame.latch.acquire(mode);
        Ok(page_id)
    }

    pub fn release_latch(&self, page_id: PageId, mode: LatchMode) {
        match self.frame(page_id) {
            // SAFETY: the caller's memo records that it holds the latch in `mode`.
            Ok(frame) => unsafe { frame.latch.release(mode) },
            Err(e) => debug_assert!(false, "release_latch: {}", e),
        }
    }

    pub fn release_fix(&self, page_id: PageId) {
        match self.frame(page_id) {
            Ok(frame) => {
                let old = frame.fix_count.fetch_sub(1, Ordering::SeqCst);
                debug_assert!(old > 0, "fix count underflow on {}", page_id);
            }
            Err(e) => debug_assert!(false, "release_fix: {}", e),
        }
    }

    fn rw_latch(&self, id: RwLatchId) -> Arc<RwLatch> {
        self.inner
            .rw_latches
            .entry(id)
            .or_insert_with(|| Arc::new(RwLatch::new()))
            .clone()
    }

    /// Acquire a named latch, creating it on first use.
    pub fn lock(&self, id: RwLatchId, mode: LatchMode) {
        self.rw_latch(id).acquire(mode);
    }

    pub fn unlock(&self, id: RwLatchId, mode: LatchMode) {
        let latch = self.rw_latch(id);
        // SAFETY: the caller's memo records that it holds the latch in `mode`.
        unsafe { latch.release(mode) };
    }

    pub fn is_locked(&self, id: RwLatchId) -> bool {
        self.inner
            .rw_latches
            .get(&id)
            .map(|l| l.is_locked())
            .unwrap_or(false)
    }

    /// Register `page_id` as modified by the LSN range `[start_lsn, end_lsn)`.
    ///
    /// A clean page is appended to the flush list with `start_lsn` as its
    /// oldest modification; an already dirty page only has its newest
    /// modification advanced.
    pub fn note_modification(&self, page_id: PageId, start_lsn: Lsn, end_lsn: Lsn) {
        let hook = self.inner.registration_hook.read().clone();
        if let Some(hook) = hook {
            hook(page_id);
        }

        let frame = match self.frame(page_id) {
            Ok(frame) => frame,
            Err(e) => {
                debug_assert!(false, "note_modification: {}", e);
                return;
            }
        };

        let mut flush_list = self.inner.flush_list.lock();
        let inserted = frame.oldest_modification.load(Ordering::SeqCst) == 0;
        if inserted {
            frame
                .oldest_modification
                .store(start_lsn.0, Ordering::SeqCst);
            flush_list.insert(page_id, start_lsn);
        }
        frame
            .newest_modification
            .fetch_max(end_lsn.0, Ordering::SeqCst);
        flush_list.record(Registration {
            page_id,
            start_lsn,
            end_lsn,
            inserted,
        });
    }

    /// Returns true if the page is not in the flush list.
    ///
    /// Serialized with `flush_up_to`: once a fixed page is seen dirty here,
    /// it stays dirty until the fix is released.
    pub fn is_clean(&self, page_id: PageId) -> bool {
        let Ok(frame) = self.frame(page_id) else {
            return true;
        };
        let _flush_list = self.inner.flush_list.lock();
        frame.oldest_modification.load(Ordering::SeqCst) == 0
    }

    /// Mark as written every dirty page whose newest modification is at or
    /// below `lsn`. The redo log must already be written up to `lsn`.
    ///
    /// Buffer-fixed pages are skipped: a mini-transaction holding the page
    /// may be about to register a modification against the dirty state it
    /// observed. Returns the number of pages cleaned.
    pub fn flush_up_to(&self, lsn: Lsn) -> usize {
        let mut flush_list = self.inner.flush_list.lock();
        let candidates: Vec<PageId> = flush_list.entries().map(|e| e.page_id).collect();

        let mut cleaned = 0;
        for page_id in candidates {
            let Ok(frame) = self.frame(page_id) else {
                continue;
            };
            if frame.newest_modification.load(Ordering::SeqCst) > lsn.0
                || frame.fix_count.load(Ordering::SeqCst) > 0
            {
                continue;
            }
            frame.oldest_modification.store(0, Ordering::SeqCst);
            frame.newest_modification.store(0, Ordering::SeqCst);
            flush_list.remove(page_id);
            cleaned += 1;
        }

        log::debug!("flushed {} pages up to {}", cleaned, lsn);
        cleaned
    }

    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.inner.flush_list.lock().oldest_modification()
    }

    pub fn flush_list_snapshot(&self) -> Vec<FlushListEntry> {
        self.inner.flush_list.lock().entries().copied().collect()
    }

    pub fn registration_history(&self) -> Vec<Registration> {
        self.inner.flush_list.lock().history().to_vec()
    }

    pub fn is_flush_list_ordered(&self) -> bool {
        let flush_list = self.inner.flush_list.lock();
        flush_list.is_ordered() && flush_list.misordered() == 0
    }

    pub fn set_registration_hook(&self, hook: Option<RegistrationHook>) {
        *self.inner.registration_hook.write() = hook;
    }

    pub fn fix_count(&self, page_id: PageId) -> u32 {
        self.frame(page_id)
            .map(|f| f.fix_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_latched(&self, page_id: PageId) -> bool {
        self.frame(page_id)
            .map(|f| f.latch.is_locked())
            .unwrap_or(false)
    }

    pub fn page_lsn_range(&self, page_id: PageId) -> Option<(Lsn, Lsn)> {
        let frame = self.frame(page_id).ok()?;
        let oldest = frame.oldest_modification.load(Ordering::SeqCst);
        if oldest == 0 {
            return None;
        }
        Some((
            Lsn(oldest),
            Lsn(frame.newest_modification.load(Ordering::SeqCst)),
        ))
    }

    pub fn read_page(&self, page_id: PageId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        check_bounds(page_id, offset, len)?;
        let frame = self.frame(page_id)?;
        let data = frame.data.lock();
        Ok(data[offset..offset + len].to_vec())
    }

    /// Copy `bytes` into the page image. The caller must hold an SX or X
    /// latch on the page.
    pub fn write_page(&self, page_id: PageId, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        check_bounds(page_id, offset, bytes.len())?;
        let frame = self.frame(page_id)?;
        let mut data = frame.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

fn check_bounds(page_id: PageId, offset: usize, len: usize) -> StorageResult<()> {
    if offset + len > PAGE_SIZE {
        return Err(StorageError::OutOfBounds {
            page_id,
            offset,
            len,
        });
    }
    Ok(())
}

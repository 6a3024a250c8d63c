//! Read/write latches guarding pages and shared index structures.
//!
//! Latches are acquired and released explicitly rather than through guards:
//! a mini-transaction records every latch it takes in its memo and releases
//! them in a later call, possibly long after the acquiring stack frame is gone.

use parking_lot::lock_api::{RawRwLock as _, RawRwLockUpgrade as _};
use parking_lot::RawRwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type of latch acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatchMode {
    /// Shared; compatible with `Shared` and `SharedExclusive`.
    Shared,
    /// Shared-exclusive; compatible with `Shared` only.
    SharedExclusive,
    Exclusive,
}

/// Identifier of a named latch (an index tree latch, a space header latch)
/// owned by the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RwLatchId(pub u32);

impl fmt::Display for RwLatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "latch#{}", self.0)
    }
}

/// Statistics for latch operations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatchStatistics {
    pub shared_acquisitions: u64,
    pub sx_acquisitions: u64,
    pub exclusive_acquisitions: u64,
}

pub struct RwLatch {
    raw: RawRwLock,
    shared: AtomicU64,
    sx: AtomicU64,
    exclusive: AtomicU64,
}

impl RwLatch {
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            shared: AtomicU64::new(0),
            sx: AtomicU64::new(0),
            exclusive: AtomicU64::new(0),
        }
    }

    /// Acquire the latch in `mode`, blocking until it is granted.
    pub fn acquire(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => {
                self.raw.lock_shared();
                self.shared.fetch_add(1, Ordering::Relaxed);
            }
            LatchMode::SharedExclusive => {
                self.raw.lock_upgradable();
                self.sx.fetch_add(1, Ordering::Relaxed);
            }
            LatchMode::Exclusive => {
                self.raw.lock_exclusive();
                self.exclusive.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Try to acquire the latch without blocking.
    pub fn try_acquire(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::Shared => self.raw.try_lock_shared(),
            LatchMode::SharedExclusive => self.raw.try_lock_upgradable(),
            LatchMode::Exclusive => self.raw.try_lock_exclusive(),
        }
    }

    /// Release a latch previously acquired in `mode`.
    ///
    /// # Safety
    ///
    /// The caller must currently hold this latch in exactly `mode`.
    pub unsafe fn release(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.raw.unlock_shared(),
            LatchMode::SharedExclusive => self.raw.unlock_upgradable(),
            LatchMode::Exclusive => self.raw.unlock_exclusive(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn statistics(&self) -> LatchStatistics {
        LatchStatistics {
            shared_acquisitions: self.shared.load(Ordering::Relaxed),
            sx_acquisitions: self.sx.load(Ordering::Relaxed),
            exclusive_acquisitions: self.exclusive.load(Ordering::Relaxed),
        }
    }
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLatch")
            .field("locked", &self.is_locked())
            .finish()
    }
}

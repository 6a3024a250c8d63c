//! Mini-transaction state and logging mode.

/// Lifecycle of a mini-transaction. Transitions only go forward:
/// `Active` -> `Committing` -> `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrState {
    /// Latches may be taken and redo recorded.
    Active,
    /// Inside `commit`.
    Committing,
    /// Buffers released; the handle may only be restarted.
    Committed,
}

impl std::fmt::Display for MtrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committing => write!(f, "Committing"),
            Self::Committed => write!(f, "Committed"),
        }
    }
}

/// What a mini-transaction writes to the redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MtrLogMode {
    /// Log every record.
    #[default]
    All,
    /// Modified pages are registered in the flush list but nothing is logged.
    NoRedo,
    /// Nothing is logged and nothing is registered.
    None,
    /// Log everything; callers pick the compact encoding for inserts.
    ShortInserts,
}

impl MtrLogMode {
    /// True if `record` keeps the bytes it is given.
    pub fn writes_redo(&self) -> bool {
        matches!(self, Self::All | Self::ShortInserts)
    }
}

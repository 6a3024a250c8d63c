use std::collections::VecDeque;

use crate::redo::Lsn;
use crate::storage::PageId;

/// A dirty page and the LSN range that dirtied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushListEntry {
    pub page_id: PageId,
    /// Start LSN of the first mini-transaction that dirtied the page.
    pub oldest_modification: Lsn,
}

/// One call into `note_modification`, in the order the calls happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub page_id: PageId,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    /// True if this call inserted the page into the flush list.
    pub inserted: bool,
}

/// Dirty pages ordered by `oldest_modification`, oldest at the front.
///
/// Insertions always happen at the back, so the list stays sorted only if
/// callers insert in LSN order. The flush-order lock in the redo log is what
/// guarantees that; the list merely records any violation.
#[derive(Debug, Default)]
pub struct FlushList {
    entries: VecDeque<FlushListEntry>,
    history: Vec<Registration>,
    misordered: u64,
}

impl FlushList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert(&mut self, page_id: PageId, oldest_modification: Lsn) {
        if let Some(last) = self.entries.back() {
            if last.oldest_modification > oldest_modification {
                self.misordered += 1;
                log::error!(
                    "flush list order violated: {} at {} inserted after {} at {}",
                    page_id,
                    oldest_modification,
                    last.page_id,
                    last.oldest_modification
                );
            }
        }
        self.entries.push_back(FlushListEntry {
            page_id,
            oldest_modification,
        });
    }

    pub(super) fn record(&mut self, registration: Registration) {
        self.history.push(registration);
    }

    pub(super) fn remove(&mut self, page_id: PageId) -> bool {
        match self.entries.iter().position(|e| e.page_id == page_id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.entries.front().map(|e| e.oldest_modification)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FlushListEntry> {
        self.entries.iter()
    }

    pub fn history(&self) -> &[Registration] {
        &self.history
    }

    /// Number of insertions that broke LSN order.
    pub fn misordered(&self) -> u64 {
        self.misordered
    }

    pub fn is_ordered(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| a.oldest_modification <= b.oldest_modification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_in_order() {
        let mut list = FlushList::new();
        list.insert(PageId::new(1, 1), Lsn(100));
        list.insert(PageId::new(1, 2), Lsn(100));
        list.insert(PageId::new(1, 3), Lsn(150));

        assert_eq!(list.len(), 3);
        assert_eq!(list.oldest_modification(), Some(Lsn(100)));
        assert!(list.is_ordered());
        assert_eq!(list.misordered(), 0);
    }

    #[test]
    fn test_misordered_insert_is_counted() {
        let mut list = FlushList::new();
        list.insert(PageId::new(1, 1), Lsn(200));
        list.insert(PageId::new(1, 2), Lsn(100));

        assert!(!list.is_ordered());
        assert_eq!(list.misordered(), 1);
    }

    #[test]
    fn test_remove() {
        let mut list = FlushList::new();
        list.insert(PageId::new(1, 1), Lsn(100));
        list.insert(PageId::new(1, 2), Lsn(120));

        assert!(list.remove(PageId::new(1, 1)));
        assert!(!list.remove(PageId::new(1, 1)));
        assert_eq!(list.oldest_modification(), Some(Lsn(120)));
    }
}

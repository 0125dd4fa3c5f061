//! In-memory index over the entries held on disk.
//!
//! Entries are kept in a `VecDeque` ordered by index. Because a payload is
//! an `Arc<[u8]>` (see [`crate::log_entry::LogEntry`]), truncation never has
//! to negotiate with concurrent readers explicitly: dropping our slot just
//! decrements the refcount, and the bytes are freed once the replication
//! module's in-flight clones are also dropped. The "exclusive ownership
//! enforced by per-entry refcount" requirement from the design falls out of
//! `Arc`'s own bookkeeping rather than anything this module has to track.

use std::collections::VecDeque;

use crate::log_entry::LogEntry;
use crate::types::{LogIndex, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupMiss;

#[derive(Debug, Default)]
pub struct LogIndexTable {
    /// Index of the first entry in `entries`; 0 when the log is empty,
    /// meaning "nothing here, including possibly because everything below
    /// this point is covered by a snapshot".
    first_index: LogIndex,
    entries: VecDeque<LogEntry>,
}

impl LogIndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrates the table after a snapshot or restart: entries already on
    /// disk are handed in with the index their first entry occupies.
    pub fn from_entries(first_index: LogIndex, entries: Vec<LogEntry>) -> Self {
        LogIndexTable {
            first_index,
            entries: entries.into(),
        }
    }

    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        let index = entry.index;
        if self.entries.is_empty() {
            self.first_index = index;
        }
        self.entries.push_back(entry);
        index
    }

    pub fn get(&self, index: LogIndex) -> Result<&LogEntry, LookupMiss> {
        if index < self.first_index || self.entries.is_empty() {
            return Err(LookupMiss);
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset).ok_or(LookupMiss)
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(0)
    }

    pub fn term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).ok().map(|e| e.term)
    }

    /// First index still held in memory. 0 if the log is empty.
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term(index) == Some(term)
    }

    /// Drops every entry with `index >= from_index` (conflict resolution on
    /// a follower whose log diverged from the leader's).
    pub fn truncate_suffix(&mut self, from_index: LogIndex) {
        while let Some(back) = self.entries.back() {
            if back.index >= from_index {
                self.entries.pop_back();
            } else {
                break;
            }
        }
        if self.entries.is_empty() {
            self.first_index = 0;
        }
    }

    /// Drops every entry with `index <= up_to_index` (post-snapshot
    /// compaction). Leaves `first_index` positioned just past the cut.
    pub fn truncate_prefix(&mut self, up_to_index: LogIndex) {
        while let Some(front) = self.entries.front() {
            if front.index <= up_to_index {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.first_index = if let Some(front) = self.entries.front() {
            front.index
        } else {
            up_to_index + 1
        };
    }

    pub fn iter_from(&self, from_index: LogIndex) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.index >= from_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::EntryType;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, EntryType::Command, vec![index as u8])
    }

    #[test]
    fn append_and_get() {
        let mut t = LogIndexTable::new();
        t.append(entry(1, 1));
        t.append(entry(2, 1));
        assert_eq!(t.last_index(), 2);
        assert_eq!(t.last_term(), 1);
        assert_eq!(t.get(1).unwrap().index, 1);
        assert!(t.get(3).is_err());
    }

    #[test]
    fn truncate_suffix_drops_conflicting_tail() {
        let mut t = LogIndexTable::new();
        for i in 1..=5 {
            t.append(entry(i, 1));
        }
        t.truncate_suffix(3);
        assert_eq!(t.last_index(), 2);
        assert!(t.get(3).is_err());
    }

    #[test]
    fn truncate_prefix_drops_snapshotted_head() {
        let mut t = LogIndexTable::new();
        for i in 1..=5 {
            t.append(entry(i, 1));
        }
        t.truncate_prefix(3);
        assert_eq!(t.first_index(), 4);
        assert!(t.get(3).is_err());
        assert_eq!(t.get(4).unwrap().index, 4);
    }

    #[test]
    fn truncate_prefix_of_everything_anchors_first_index_past_cut() {
        let mut t = LogIndexTable::new();
        for i in 1..=3 {
            t.append(entry(i, 1));
        }
        t.truncate_prefix(3);
        assert!(t.is_empty());
        assert_eq!(t.first_index(), 4);
        assert_eq!(t.last_index(), 0);
    }

    #[test]
    fn matches_checks_term_at_index() {
        let mut t = LogIndexTable::new();
        t.append(entry(1, 2));
        assert!(t.matches(1, 2));
        assert!(!t.matches(1, 3));
        assert!(!t.matches(5, 2));
    }

    #[test]
    fn truncation_releases_payload_once_other_refs_drop() {
        let mut t = LogIndexTable::new();
        t.append(entry(1, 1));
        let payload = t.get(1).unwrap().payload.clone();
        assert_eq!(std::sync::Arc::strong_count(&payload), 2);
        t.truncate_suffix(1);
        assert_eq!(std::sync::Arc::strong_count(&payload), 1);
    }
}

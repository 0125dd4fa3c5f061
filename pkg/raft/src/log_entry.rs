//! The unit of replication: a single log entry.

use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, Term};

/// The kind of payload carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryType {
    /// An opaque command destined for the caller's state machine.
    Command = 0,
    /// An encoded `Configuration`, installed once committed.
    Configuration = 1,
    /// A no-op appended by a new leader so its commit index can advance
    /// even in an otherwise idle cluster.
    Barrier = 2,
}

impl EntryType {
    pub fn from_byte(b: u8) -> Option<EntryType> {
        match b {
            0 => Some(EntryType::Command),
            1 => Some(EntryType::Configuration),
            2 => Some(EntryType::Barrier),
            _ => None,
        }
    }
}

/// A single entry in the replicated log.
///
/// `(term, index)` uniquely identifies an entry forever: once any server
/// reports an entry at `index` committed, no server will ever again hold a
/// different entry at that index (Log Matching, invariant 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub entry_type: EntryType,
    /// Reference-counted so the replication module can hold onto payloads
    /// that are in flight to followers without copying them, and so a
    /// truncation can't free memory still referenced by an outstanding send.
    pub payload: std::sync::Arc<[u8]>,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, entry_type: EntryType, payload: Vec<u8>) -> Self {
        LogEntry {
            index,
            term,
            entry_type,
            payload: payload.into(),
        }
    }
}

/// `(term, index)` — used to identify a proposal and to compare log
/// positions for up-to-date-ness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

//! Primitive identifiers shared across every module.

use serde::{Deserialize, Serialize};

/// Uniquely identifies a server for the lifetime of the cluster. Assigned
/// out of band (never zero — zero is reserved to mean "no server").
pub type ServerId = u64;

/// Monotonically non-decreasing election term.
pub type Term = u64;

/// 1-based, contiguous log index. Index 0 means "before the start of the log".
pub type LogIndex = u64;

/// The role a server plays with respect to quorum and replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Counts towards quorum and may become leader.
    Voter,
    /// Receives the replicated log but never counts towards quorum and
    /// never campaigns; used to warm up a server before promoting it.
    StandBy,
    /// Receives nothing by default; reserved as a cold spare identity slot
    /// (e.g. pre-registered for a future `AddMember`).
    Spare,
}

impl ServerRole {
    pub fn is_voter(self) -> bool {
        matches!(self, ServerRole::Voter)
    }
}

//! Read-only observability snapshot.
//!
//! Metrics exporters are explicitly out of scope for this crate, but the
//! engine still needs a way to tell a host process what
//! it's doing. [`RaftMetricsSnapshot`] is refreshed on a `tokio::sync::watch`
//! channel after every main-loop turn, the same pattern
//! `cbaugus-rust_loadtest`'s `raft.rs` uses over `openraft::Raft::metrics()`
//! — a host process wires the receiver into whatever exporter it likes
//! (`prometheus`, logs, a status endpoint) without this crate depending on
//! any of them.

use tokio::sync::watch;

use crate::types::{LogIndex, ServerId, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMetricsSnapshot {
    pub id: ServerId,
    pub role: &'static str,
    pub current_term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_hint: Option<ServerId>,
}

impl RaftMetricsSnapshot {
    pub fn unavailable(id: ServerId) -> Self {
        RaftMetricsSnapshot {
            id,
            role: "unavailable",
            current_term: 0,
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
        }
    }
}

/// Creates the sender/receiver pair a [`crate::server::RaftServer`] publishes
/// through and a caller subscribes to.
pub fn channel(initial: RaftMetricsSnapshot) -> (watch::Sender<RaftMetricsSnapshot>, watch::Receiver<RaftMetricsSnapshot>) {
    watch::channel(initial)
}

//! Wire-level RPC payloads and the transport seam.
//!
//! Byte-level framing of the RPC *channel* itself (how a `RequestVoteRequest`
//! gets from one process to another) is delegated entirely to the caller's
//! [`RaftTransport`] implementation — this module only defines the payload
//! types, all of which are plain `serde`-derived structs so a transport can
//! pick whatever encoding it wants (JSON, bincode, protobuf...). This
//! mirrors how `cbaugus-rust_loadtest`'s `GrpcNetwork` JSON-encodes openraft's
//! request types and ships them as opaque bytes inside its own proto
//! envelope; we keep the same separation of concerns without committing to
//! gRPC specifically.

use serde::{Deserialize, Serialize};

use crate::log_entry::LogEntry;
use crate::types::{LogIndex, ServerId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// True for the non-disruptive pre-vote phase: granting this never
    /// mutates the receiver's persistent term or voted-for.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<WireLogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Set only when `success` is false: a conflict hint (the follower's
    /// first log index, or the index past the end of its log) the leader
    /// can jump `next_index` to directly instead of decrementing one at a
    /// time. Always `None` on success.
    pub last_log_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: Term,
}

/// An over-the-wire representation of a log entry. Kept distinct from
/// [`LogEntry`] because the in-memory struct holds payload bytes behind an
/// `Arc` for cheap fan-out to many in-flight sends, while the wire form owns
/// a plain, serializable `Vec<u8>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub entry_type: u8,
    pub payload: Vec<u8>,
}

impl From<&LogEntry> for WireLogEntry {
    fn from(e: &LogEntry) -> Self {
        WireLogEntry {
            index: e.index,
            term: e.term,
            entry_type: e.entry_type as u8,
            payload: e.payload.to_vec(),
        }
    }
}

impl TryFrom<WireLogEntry> for LogEntry {
    type Error = crate::error::RaftError;

    fn try_from(w: WireLogEntry) -> Result<Self, Self::Error> {
        let entry_type = crate::log_entry::EntryType::from_byte(w.entry_type).ok_or_else(|| {
            crate::error::RaftError::Corrupt(format!("unknown entry type byte {}", w.entry_type))
        })?;
        Ok(LogEntry::new(w.index, w.term, entry_type, w.payload))
    }
}

/// Everything this server may need to say to one peer during a single tick.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    RequestVote(RequestVoteRequest),
    AppendEntries {
        request: AppendEntriesRequest,
        /// Index of the last entry included in `request`, so the reply
        /// handler can advance `match_index` even if later ticks mutate the
        /// log further before the reply arrives.
        last_sent_index: LogIndex,
    },
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
}

/// A single outgoing RPC, addressed to one peer.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub to: ServerId,
    pub message: OutgoingMessage,
}

/// The abstract messenger this crate delegates all network I/O to.
///
/// Implementations serialize/deserialize and deliver these RPCs over
/// whatever transport the host process prefers (gRPC, HTTP, a custom TCP
/// protocol...); this crate never constructs a socket itself.
pub trait RaftTransport: Send + Sync + 'static {
    fn send_request_vote(
        &self,
        to: ServerId,
        request: RequestVoteRequest,
    ) -> impl std::future::Future<Output = Result<RequestVoteResponse, crate::error::RaftError>> + Send;

    fn send_append_entries(
        &self,
        to: ServerId,
        request: AppendEntriesRequest,
    ) -> impl std::future::Future<Output = Result<AppendEntriesResponse, crate::error::RaftError>> + Send;

    fn send_install_snapshot(
        &self,
        to: ServerId,
        request: InstallSnapshotRequest,
    ) -> impl std::future::Future<Output = Result<InstallSnapshotResponse, crate::error::RaftError>> + Send;

    fn send_timeout_now(
        &self,
        to: ServerId,
        request: TimeoutNowRequest,
    ) -> impl std::future::Future<Output = Result<(), crate::error::RaftError>> + Send;
}

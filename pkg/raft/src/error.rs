use crate::types::ServerId;

/// Unified error type returned by every fallible public operation.
///
/// Variants are grouped into the three tiers described by the module docs:
/// input validation (no state changes), transient I/O (the caller should
/// retry or the protocol downgrades to a safe state), and fatal (the
/// instance becomes unavailable and the message is kept for inspection).
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    // -- input validation --
    #[error("server id must be nonzero")]
    BadServerId,

    #[error("server must have a non-empty address")]
    NoServerAddress,

    #[error("server id {0} is already present in the configuration")]
    DupServerId(ServerId),

    #[error("address {0:?} is already used by another server")]
    DupServerAddress(String),

    #[error("server id {0} is not present in the configuration")]
    UnknownServerId(ServerId),

    #[error("out of memory")]
    NoMemory,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // -- transient --
    #[error("operation could not be started because the subsystem is busy")]
    Busy,

    #[error("a configuration change is already in flight")]
    ConfigurationBusy,

    #[error("this server is not the leader{}", .leader_hint.map(|id| format!(" (leader hint: {id})")).unwrap_or_default())]
    NotLeader { leader_hint: Option<ServerId> },

    #[error("leadership was lost before the proposal could be committed")]
    LeadershipLost,

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("operation was canceled")]
    Canceled,

    // -- fatal --
    #[error("on-disk state is corrupt: {0}")]
    Corrupt(String),

    #[error("the server is shutting down")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, RaftError>;

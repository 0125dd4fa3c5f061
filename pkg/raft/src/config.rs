//! Runtime tunables, validated once at construction.
//!
//! Mirrors the shape of `openraft::Config::validate()` as used by
//! `cbaugus-rust_loadtest/src/raft.rs::start_raft_node` — a plain struct with
//! sane defaults, built with the struct-update pattern, checked once before
//! the engine starts rather than re-validated on every access.

use std::time::Duration;

use crate::error::{RaftError, Result};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout; the actual per-election timeout is drawn
    /// uniformly from `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,
    /// How often a leader with nothing new to send still pings a follower.
    pub heartbeat_timeout: Duration,
    /// Number of log entries grown since `first_index` that triggers a
    /// snapshot.
    pub snapshot_threshold: u64,
    /// Entries kept in the log beyond a snapshot's `last_included_index`.
    pub snapshot_trailing: u64,
    /// Target number of pre-allocated open segments kept ready in the pool.
    pub segment_target_pool_size: usize,
    /// Size in bytes of a single block within a segment.
    pub block_size: u64,
    /// Number of blocks per segment file (segment size = block_size *
    /// blocks_per_segment).
    pub blocks_per_segment: u64,
    /// Whether candidates run a non-disruptive pre-vote phase before really
    /// campaigning.
    pub pre_vote: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(100),
            snapshot_threshold: 1024,
            snapshot_trailing: 2048,
            segment_target_pool_size: 2,
            block_size: 4096,
            blocks_per_segment: 256,
            pre_vote: true,
        }
    }
}

impl RaftConfig {
    pub fn validate(self) -> Result<Self> {
        if self.heartbeat_timeout >= self.election_timeout {
            return Err(RaftError::InvalidConfig(
                "heartbeat_timeout must be smaller than election_timeout".into(),
            ));
        }
        if self.segment_target_pool_size == 0 {
            return Err(RaftError::InvalidConfig(
                "segment_target_pool_size must be at least 1".into(),
            ));
        }
        if self.block_size == 0 || self.blocks_per_segment == 0 {
            return Err(RaftError::InvalidConfig(
                "block_size and blocks_per_segment must be nonzero".into(),
            ));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::InvalidConfig(
                "snapshot_threshold must be at least 1".into(),
            ));
        }
        Ok(self)
    }

    pub fn segment_size_bytes(&self) -> u64 {
        self.block_size * self.blocks_per_segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election_timeout() {
        let cfg = RaftConfig {
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1000),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn zero_pool_size_rejected() {
        let cfg = RaftConfig {
            segment_target_pool_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}

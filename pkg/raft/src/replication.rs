//! Leader-side per-follower replication progress.
//!
//! One [`FollowerProgress`] is kept per peer for the lifetime of a
//! leadership term. `probe`/`pipeline`/`snapshot` are the three send
//! modes; the leader never has more than one outstanding `AppendEntries`
//! to a follower in `probe`, but may have several in flight once it has
//! promoted a follower to `pipeline`.

use std::collections::HashMap;
use std::time::Instant;

use crate::types::{LogIndex, ServerId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// One `AppendEntries` outstanding at a time; used until the follower has
    /// confirmed it is caught up at least once.
    Probe,
    /// Multiple batches may be outstanding; `next_index` advances
    /// optimistically as each is dispatched.
    Pipeline,
    /// The follower needs entries the leader has already compacted away;
    /// an `InstallSnapshot` is in flight and no `AppendEntries` is sent
    /// until it is acknowledged.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct FollowerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub mode: ReplicationMode,
    /// True while an `AppendEntries`/`InstallSnapshot` to this follower has
    /// been dispatched and no reply (or send failure) has been observed yet.
    /// In `Pipeline` mode this only gates the snapshot-style "don't resend
    /// an identical empty heartbeat" bookkeeping, not the number of
    /// in-flight requests.
    pub request_pending: bool,
    pub last_sent: Option<Instant>,
}

impl FollowerProgress {
    pub fn new(last_log_index: LogIndex) -> Self {
        FollowerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
            mode: ReplicationMode::Probe,
            request_pending: false,
            last_sent: None,
        }
    }

    /// Applies a successful `AppendEntriesResponse`. `last_sent_index` is the
    /// index of the last entry that *this* reply's request carried.
    pub fn on_append_success(&mut self, last_sent_index: LogIndex) {
        if last_sent_index > self.match_index {
            self.match_index = last_sent_index;
            self.next_index = last_sent_index + 1;
        }
        if self.mode == ReplicationMode::Probe {
            self.mode = ReplicationMode::Pipeline;
        }
        self.request_pending = false;
    }

    /// Applies a rejected `AppendEntriesResponse`. `conflict_hint`, when
    /// present, lets the leader jump `next_index` directly instead of
    /// decrementing one step at a time. Falls back to `Snapshot` mode once
    /// `next_index` would drop below what the leader still has on disk.
    pub fn on_append_mismatch(&mut self, conflict_hint: Option<LogIndex>, local_first_index: LogIndex) {
        self.next_index = match conflict_hint {
            Some(hint) => hint + 1,
            None => self.next_index.saturating_sub(1).max(1),
        };
        self.mode = if self.next_index < local_first_index {
            ReplicationMode::Snapshot
        } else {
            ReplicationMode::Probe
        };
        self.request_pending = false;
    }

    pub fn on_install_snapshot_success(&mut self, last_included_index: LogIndex) {
        self.match_index = self.match_index.max(last_included_index);
        self.next_index = last_included_index + 1;
        self.mode = ReplicationMode::Probe;
        self.request_pending = false;
    }

    pub fn on_send_failure(&mut self) {
        self.request_pending = false;
    }
}

/// Replication state for every follower, owned by the leader for the
/// duration of a single term.
#[derive(Debug, Default)]
pub struct LeaderState {
    pub followers: HashMap<ServerId, FollowerProgress>,
}

impl LeaderState {
    pub fn new(peer_ids: impl Iterator<Item = ServerId>, last_log_index: LogIndex) -> Self {
        let mut followers = HashMap::new();
        for id in peer_ids {
            followers.insert(id, FollowerProgress::new(last_log_index));
        }
        LeaderState { followers }
    }

    pub fn progress_mut(&mut self, id: ServerId, last_log_index: LogIndex) -> &mut FollowerProgress {
        self.followers
            .entry(id)
            .or_insert_with(|| FollowerProgress::new(last_log_index))
    }

    /// The highest `N` such that a majority of `voter_ids` (excluding
    /// ourselves, whose own match is implicitly `our_match_index`) have
    /// `match_index >= N`, searching no further back than `lower_bound`
    /// (exclusive) — the leader never needs to consider committing below
    /// its current `commit_index`.
    pub fn quorum_match_index(
        &self,
        voter_ids: &[ServerId],
        our_match_index: LogIndex,
        lower_bound: LogIndex,
        majority: usize,
    ) -> Option<LogIndex> {
        // The Nth-highest match_index among all voters (including
        // ourselves) is the highest index a majority agrees they hold;
        // sorting descending and taking the `majority`-th entry finds it
        // without scanning candidate indices one at a time.
        let mut match_indices: Vec<LogIndex> = vec![our_match_index];
        for id in voter_ids {
            if let Some(p) = self.followers.get(id) {
                match_indices.push(p.match_index);
            }
        }
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        match_indices
            .get(majority.saturating_sub(1))
            .copied()
            .filter(|&nth| nth > lower_bound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReplyContext {
    pub term: Term,
    pub last_sent_index: LogIndex,
}

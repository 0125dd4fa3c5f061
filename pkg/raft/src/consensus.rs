//! The role engine: the single state machine that owns term, role,
//! and commit index, and is the only thing in the crate allowed to mutate
//! them. Every public method here is meant to be called from the one task
//! that owns a [`ConsensusModule`] — see the crate's concurrency model — so
//! none of it takes a lock; `&mut self` is the synchronization.
//!
//! Storage is threaded through explicitly rather than owned, because
//! `LogStorage` already does its own `tokio::task::spawn_blocking` +
//! `select!`-driven completion dance (see `storage::pool`); the consensus
//! module just awaits the outcome of whatever it asked for.

use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::config::RaftConfig;
use crate::configuration::Configuration;
use crate::election::{random_election_timeout, would_grant_vote, CandidateState};
use crate::error::{RaftError, Result};
use crate::log_entry::EntryType;
use crate::replication::{AppendReplyContext, LeaderState};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Dispatch, InstallSnapshotRequest, InstallSnapshotResponse,
    OutgoingMessage, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest, WireLogEntry,
};
use crate::storage::LogStorage;
use crate::types::{LogIndex, ServerId, Term};

enum Role {
    Unavailable,
    Follower,
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Unavailable => "unavailable",
            Role::Follower => "follower",
            Role::Candidate(c) if c.is_pre_vote => "pre-candidate",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

/// The Raft protocol engine for one server, minus storage and transport.
pub struct ConsensusModule {
    id: ServerId,
    config: RaftConfig,
    pub(crate) configuration: Configuration,
    role: Role,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) uncommitted_configuration_index: Option<LogIndex>,
    /// Index of the most recently *applied* configuration entry, or 0 if
    /// none has ever gone through the log (the initial configuration is
    /// supplied directly to `new`, not via an entry). Used to widen the
    /// snapshot trailing window so a config change is never trimmed out
    /// from under a recovering follower.
    pub(crate) last_committed_configuration_index: LogIndex,
    /// Set once the leader has seen an entry of its own term reach
    /// `commit_index`; gates configuration changes (see DESIGN.md).
    committed_own_term: bool,
    leader_hint: Option<ServerId>,
    last_fatal_error: Option<String>,
}

impl ConsensusModule {
    /// A freshly constructed instance starts `Unavailable`; call
    /// [`ConsensusModule::activate`] once persistent state has been loaded
    /// from storage.
    pub fn new(id: ServerId, configuration: Configuration, config: RaftConfig) -> Self {
        ConsensusModule {
            id,
            config,
            configuration,
            role: Role::Unavailable,
            commit_index: 0,
            last_applied: 0,
            uncommitted_configuration_index: None,
            last_committed_configuration_index: 0,
            committed_own_term: false,
            leader_hint: None,
            last_fatal_error: None,
        }
    }

    pub fn activate(&mut self) {
        if matches!(self.role, Role::Unavailable) {
            self.role = Role::Follower;
            info!(server_id = self.id, "server activated as follower");
        }
    }

    pub fn mark_unavailable(&mut self, reason: String) {
        warn!(server_id = self.id, reason = %reason, "consensus module transitioning to unavailable");
        self.last_fatal_error = Some(reason);
        self.role = Role::Unavailable;
    }

    pub fn last_fatal_error(&self) -> Option<&str> {
        self.last_fatal_error.as_deref()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn role_name(&self) -> &'static str {
        self.role.name()
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        if self.is_leader() { Some(self.id) } else { self.leader_hint }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Advances `last_applied`; called by the apply loop once the
    /// entry at `index` has been handed to the FSM (or is a barrier).
    pub(crate) fn advance_last_applied(&mut self, index: LogIndex) {
        self.last_applied = index;
    }

    /// Installs `configuration` as the server's committed view once its
    /// log entry at `index` has been applied, retiring the uncommitted
    /// marker it was tracked under.
    pub(crate) fn install_committed_configuration(&mut self, index: LogIndex, configuration: Configuration) {
        self.configuration = configuration;
        self.last_committed_configuration_index = index;
        if self.uncommitted_configuration_index == Some(index) {
            self.uncommitted_configuration_index = None;
        }
    }

    /// Seeds `commit_index`, `last_applied`, and the committed
    /// configuration from a snapshot found durable on disk at startup.
    /// Called once from `RaftServer::start`, before `activate()` — without
    /// it a server restarting after a snapshot that trimmed the log would
    /// start at `last_applied = 0` and fault the first time the apply loop
    /// reaches for an index the snapshot already covers.
    pub(crate) fn restore_from_snapshot(&mut self, last_included_index: LogIndex, configuration: Configuration) {
        self.commit_index = self.commit_index.max(last_included_index);
        self.last_applied = self.last_applied.max(last_included_index);
        self.install_committed_configuration(last_included_index, configuration);
    }

    pub(crate) fn configuration_snapshot(&self) -> Configuration {
        self.configuration.copy()
    }

    pub(crate) fn last_committed_configuration_index(&self) -> LogIndex {
        self.last_committed_configuration_index
    }

    fn quorum_size(&self) -> usize {
        self.configuration.n_voting() / 2 + 1
    }

    fn is_voter(&self) -> bool {
        self.configuration.get(self.id).map(|s| s.role.is_voter()).unwrap_or(false)
    }

    fn peer_ids(&self) -> Vec<ServerId> {
        self.configuration.iter().map(|s| s.id).filter(|&id| id != self.id).collect()
    }

    fn voter_peer_ids(&self) -> Vec<ServerId> {
        self.configuration.voters().map(|s| s.id).filter(|&id| id != self.id).collect()
    }

    /// Any RPC or reply carrying a higher term forces a step-down to
    /// follower. Returns `true` if a step-down occurred.
    async fn observe_term(&mut self, storage: &mut LogStorage, term: Term) -> Result<bool> {
        if term <= storage.current_term() {
            return Ok(false);
        }
        storage.persist_term_and_vote(term, 0).await?;
        let was_leader = self.is_leader();
        self.role = Role::Follower;
        self.committed_own_term = false;
        if was_leader {
            info!(server_id = self.id, new_term = term, "stepping down: observed higher term");
        }
        Ok(true)
    }

    fn step_down_to_follower(&mut self) {
        self.role = Role::Follower;
        self.committed_own_term = false;
    }

    // -- election --

    pub fn election_timeout(&self) -> std::time::Duration {
        random_election_timeout(&self.config)
    }

    /// Called when the election timer fires while `Follower` or
    /// `Candidate`. Starts (or restarts) a campaign if this server is a
    /// voter in the current configuration; pre-vote runs first unless
    /// disabled.
    #[instrument(skip(self, storage), fields(server_id = self.id))]
    pub async fn on_election_timeout(&mut self, storage: &mut LogStorage, now: Instant) -> Result<Vec<Dispatch>> {
        if matches!(self.role, Role::Leader(_)) || !self.is_voter() {
            return Ok(Vec::new());
        }
        self.start_election(storage, now, self.config.pre_vote).await
    }

    async fn start_election(&mut self, storage: &mut LogStorage, now: Instant, pre_vote: bool) -> Result<Vec<Dispatch>> {
        let timeout = random_election_timeout(&self.config);
        // Pre-vote campaigns at the same prospective term but never persists
        // it — only the branch below writes through to storage.
        let term = storage.current_term() + 1;

        if !pre_vote {
            storage.persist_term_and_vote(term, self.id).await?;
            info!(server_id = self.id, term, "starting election");
        } else {
            debug!(server_id = self.id, candidate_term = term, "starting pre-vote");
        }

        self.role = Role::Candidate(CandidateState::new(now, timeout, pre_vote));

        let last_log_index = storage.index.last_index();
        let last_log_term = storage.index.last_term();
        let request_term = if pre_vote { term } else { storage.current_term() };

        let dispatches = self
            .peer_ids()
            .into_iter()
            .filter(|id| self.configuration.get(*id).map(|s| s.role.is_voter()).unwrap_or(false))
            .map(|to| Dispatch {
                to,
                message: OutgoingMessage::RequestVote(RequestVoteRequest {
                    term: request_term,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                    pre_vote,
                }),
            })
            .collect();

        // A candidate with no voting peers (or a quorum of one) already
        // satisfies quorum via its own self-vote and would otherwise wait
        // forever for a vote response that will never arrive.
        if !pre_vote {
            let already_won = matches!(&self.role, Role::Candidate(c) if c.vote_count() >= self.quorum_size());
            if already_won {
                return self.become_leader(storage).await;
            }
        }
        Ok(dispatches)
    }

    #[instrument(skip(self, storage, req), fields(server_id = self.id))]
    pub async fn handle_request_vote(
        &mut self,
        storage: &mut LogStorage,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        if !req.pre_vote {
            self.observe_term(storage, req.term).await?;
        }

        let our_term = storage.current_term();
        let voted_for = storage.voted_for();
        let granted = would_grant_vote(
            our_term,
            if voted_for == 0 { None } else { Some(voted_for) },
            storage.index.last_term(),
            storage.index.last_index(),
            req.term,
            req.candidate_id,
            req.last_log_term,
            req.last_log_index,
        );

        if granted && !req.pre_vote {
            storage.persist_term_and_vote(req.term, req.candidate_id).await?;
            debug!(server_id = self.id, candidate = req.candidate_id, term = req.term, "vote granted");
        }

        Ok(RequestVoteResponse { term: storage.current_term(), vote_granted: granted })
    }

    pub async fn handle_request_vote_response(
        &mut self,
        storage: &mut LogStorage,
        from: ServerId,
        resp: RequestVoteResponse,
    ) -> Result<Vec<Dispatch>> {
        if self.observe_term(storage, resp.term).await? {
            return Ok(Vec::new());
        }

        let (is_pre_vote, won) = match &mut self.role {
            Role::Candidate(c) => {
                c.record_reply(from, resp.vote_granted);
                (c.is_pre_vote, c.vote_count() >= self.quorum_size())
            }
            _ => return Ok(Vec::new()),
        };

        if !won {
            return Ok(Vec::new());
        }

        if is_pre_vote {
            // Pre-vote won: campaign for real, bumping the term this time.
            return self.start_election(storage, Instant::now(), false).await;
        }

        self.become_leader(storage).await
    }

    async fn become_leader(&mut self, storage: &mut LogStorage) -> Result<Vec<Dispatch>> {
        let term = storage.current_term();
        info!(server_id = self.id, term, "became leader");

        // Replication state starts from the log as it stood right at
        // election (next_index = last_log_index + 1); the barrier
        // entry appended just below then naturally goes out with the
        // first broadcast instead of being silently skipped.
        let last_log_index = storage.index.last_index();
        self.role = Role::Leader(LeaderState::new(self.peer_ids().into_iter(), last_log_index));
        self.leader_hint = Some(self.id);

        // A barrier entry in the new term lets commit_index advance even
        // in an otherwise idle cluster.
        storage.append_batch(vec![(term, EntryType::Barrier, Vec::new())]).await?;

        self.broadcast_append_entries(storage, true)
    }

    /// Builds an `AppendEntries` dispatch to every peer not already
    /// awaiting a reply, carrying whatever entries it is missing (empty if
    /// it is already caught up). Unless `force` is set (the heartbeat timer,
    /// or a brand-new leader asserting itself), a follower that is already
    /// caught up and not pending is left alone rather than re-sent an empty
    /// heartbeat on every single reply — that throttling is the heartbeat
    /// timer's job, not the response handler's.
    fn broadcast_append_entries(&mut self, storage: &mut LogStorage, force: bool) -> Result<Vec<Dispatch>> {
        let Role::Leader(leader) = &mut self.role else {
            return Ok(Vec::new());
        };
        let term = storage.current_term();
        let commit_index = self.commit_index;
        let last_index = storage.index.last_index();
        let mut out = Vec::new();

        for id in self.peer_ids() {
            let progress = leader.progress_mut(id, last_index);
            // A follower stuck behind a compacted prefix needs an
            // InstallSnapshot, not AppendEntries; the driving loop streams
            // one using `followers_needing_snapshot` since only it can read
            // the FSM/snapshot file (the state engine never touches the
            // FSM directly).
            if progress.mode == crate::replication::ReplicationMode::Snapshot {
                continue;
            }
            if progress.request_pending && progress.mode != crate::replication::ReplicationMode::Pipeline {
                continue;
            }
            if !force && !progress.request_pending && progress.next_index > last_index {
                continue;
            }

            let prev_log_index = progress.next_index.saturating_sub(1);
            let prev_log_term = storage.index.term(prev_log_index).unwrap_or(0);

            let entries: Vec<WireLogEntry> = storage
                .index
                .iter_from(progress.next_index)
                .map(WireLogEntry::from)
                .collect();
            let last_sent_index = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

            progress.request_pending = true;
            progress.last_sent = Some(Instant::now());

            out.push(Dispatch {
                to: id,
                message: OutgoingMessage::AppendEntries {
                    request: AppendEntriesRequest {
                        term,
                        leader_id: self.id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: commit_index,
                    },
                    last_sent_index,
                },
            });
        }
        Ok(out)
    }

    /// Leader-only: called on the heartbeat timer. Sends an `AppendEntries`
    /// (heartbeat or carrying new entries) to every follower not already
    /// awaiting a reply.
    pub fn on_heartbeat_timeout(&mut self, storage: &mut LogStorage) -> Result<Vec<Dispatch>> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }
        self.broadcast_append_entries(storage, true)
    }

    // -- replication --

    #[instrument(skip(self, storage, req), fields(server_id = self.id))]
    pub async fn handle_append_entries(
        &mut self,
        storage: &mut LogStorage,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.observe_term(storage, req.term).await?;
        let our_term = storage.current_term();

        if req.term < our_term {
            return Ok(AppendEntriesResponse { term: our_term, success: false, last_log_index: None });
        }

        // A valid leader in our term resets our election timer (handled by
        // the caller observing a successful reply) and is who we point
        // `NotLeader` hints at.
        self.leader_hint = Some(req.leader_id);
        if matches!(self.role, Role::Candidate(_)) {
            self.step_down_to_follower();
        }

        if req.prev_log_index != 0 && !storage.index.matches(req.prev_log_index, req.prev_log_term) {
            let hint = storage.index.last_index().min(req.prev_log_index.saturating_sub(1));
            return Ok(AppendEntriesResponse { term: our_term, success: false, last_log_index: Some(hint) });
        }

        let mut next_index = req.prev_log_index + 1;
        let mut to_append = Vec::new();
        for wire in req.entries {
            if let Ok(existing) = storage.index.get(next_index) {
                if existing.term == wire.term {
                    next_index += 1;
                    continue;
                }
                storage.truncate_suffix(next_index).await?;
            }
            let entry = crate::log_entry::LogEntry::try_from(wire)?;
            to_append.push((entry.term, entry.entry_type, entry.payload.to_vec()));
            next_index += 1;
        }
        if !to_append.is_empty() {
            storage.append_batch(to_append).await?;
        }

        let last_new_index = storage.index.last_index();
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_new_index);
        }

        Ok(AppendEntriesResponse { term: our_term, success: true, last_log_index: None })
    }

    pub async fn handle_append_entries_response(
        &mut self,
        storage: &mut LogStorage,
        from: ServerId,
        resp: AppendEntriesResponse,
        ctx: AppendReplyContext,
    ) -> Result<Vec<Dispatch>> {
        if self.observe_term(storage, resp.term).await? {
            return Ok(Vec::new());
        }
        if !self.is_leader() {
            return Ok(Vec::new());
        }

        let local_first_index = storage.index.first_index().max(1);
        let mut redispatch = Vec::new();
        if let Role::Leader(leader) = &mut self.role {
            let progress = leader.progress_mut(from, storage.index.last_index());
            if resp.success {
                progress.on_append_success(ctx.last_sent_index);
            } else {
                progress.on_append_mismatch(resp.last_log_index, local_first_index);
            }
        }

        self.advance_commit_index(storage);
        redispatch.extend(self.broadcast_append_entries(storage, false)?);
        Ok(redispatch)
    }

    fn advance_commit_index(&mut self, storage: &LogStorage) {
        let Role::Leader(leader) = &self.role else { return };
        let our_match_index = storage.index.last_index();
        let voter_ids = self.voter_peer_ids();
        let quorum = self.quorum_size();

        if let Some(n) = leader.quorum_match_index(&voter_ids, our_match_index, self.commit_index, quorum) {
            // Only commit through an entry from the leader's own
            // term; entries from prior terms are committed transitively
            // once a same-term entry commits over them.
            if storage.index.term(n) == Some(storage.current_term()) {
                self.commit_index = n;
                self.committed_own_term = true;
            }
        }
    }

    /// Followers parked in `Snapshot` mode with no install currently in
    /// flight: the driving loop is the only thing that can actually stream
    /// one (it alone holds the FSM and the latest snapshot file), so this
    /// just reports who needs one and marks them pending so the next tick
    /// doesn't report them again. Pair with [`ConsensusModule::clear_request_pending`]
    /// if the driving loop fails to find a snapshot to send.
    pub fn followers_needing_snapshot(&mut self) -> Vec<ServerId> {
        let Role::Leader(leader) = &mut self.role else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (id, progress) in leader.followers.iter_mut() {
            if progress.mode == crate::replication::ReplicationMode::Snapshot && !progress.request_pending {
                progress.request_pending = true;
                out.push(*id);
            }
        }
        out
    }

    /// Clears a follower's in-flight flag without recording any progress;
    /// used when the driving loop could not actually send the RPC it was
    /// asked to (no snapshot file available yet, or the send failed).
    pub fn clear_request_pending(&mut self, id: ServerId) {
        if let Role::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.followers.get_mut(&id) {
                progress.request_pending = false;
            }
        }
    }

    // -- snapshots --

    pub async fn handle_install_snapshot(
        &mut self,
        storage: &mut LogStorage,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.observe_term(storage, req.term).await?;
        let our_term = storage.current_term();
        if req.term < our_term {
            return Ok(InstallSnapshotResponse { term: our_term });
        }
        self.leader_hint = Some(req.leader_id);

        storage.install_snapshot(req.last_included_index).await?;
        self.commit_index = self.commit_index.max(req.last_included_index);
        self.last_applied = self.last_applied.max(req.last_included_index);
        if let Ok(configuration) = Configuration::decode(&req.configuration) {
            self.configuration = configuration;
        }

        Ok(InstallSnapshotResponse { term: our_term })
    }

    pub async fn handle_install_snapshot_response(
        &mut self,
        storage: &mut LogStorage,
        from: ServerId,
        resp: InstallSnapshotResponse,
        last_included_index: LogIndex,
    ) -> Result<Vec<Dispatch>> {
        if self.observe_term(storage, resp.term).await? {
            return Ok(Vec::new());
        }
        if let Role::Leader(leader) = &mut self.role {
            leader.progress_mut(from, storage.index.last_index()).on_install_snapshot_success(last_included_index);
        }
        Ok(Vec::new())
    }

    /// A follower receiving `TimeoutNow` (leadership transfer) starts a
    /// real election immediately, bypassing pre-vote and its own timer.
    pub async fn handle_timeout_now(
        &mut self,
        storage: &mut LogStorage,
        req: TimeoutNowRequest,
    ) -> Result<Vec<Dispatch>> {
        self.observe_term(storage, req.term).await?;
        if !self.is_voter() || self.is_leader() {
            return Ok(Vec::new());
        }
        self.start_election(storage, Instant::now(), false).await
    }

    // -- proposals --

    #[instrument(skip(self, storage, payload), fields(server_id = self.id))]
    pub async fn propose_command(&mut self, storage: &mut LogStorage, payload: Vec<u8>) -> Result<(LogIndex, Vec<Dispatch>)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader_hint: self.leader_hint });
        }
        let term = storage.current_term();
        let index = storage.append_batch(vec![(term, EntryType::Command, payload)]).await?;
        let dispatches = self.broadcast_append_entries(storage, false)?;
        Ok((index, dispatches))
    }

    /// Proposes a configuration change. Rejected with `ConfigurationBusy`
    /// if a prior change is still uncommitted, or if this leader has not
    /// yet committed an entry of its own term (see DESIGN.md: a freshly
    /// elected leader's view of the committed configuration may still lag,
    /// so changing membership before its own barrier commits risks
    /// building on a configuration that a higher-term leader could still
    /// override).
    pub async fn propose_configuration_change(
        &mut self,
        storage: &mut LogStorage,
        desired: Configuration,
    ) -> Result<(LogIndex, Vec<Dispatch>)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader_hint: self.leader_hint });
        }
        if self.uncommitted_configuration_index.is_some() || !self.committed_own_term {
            return Err(RaftError::ConfigurationBusy);
        }
        let term = storage.current_term();
        let index = storage.append_batch(vec![(term, EntryType::Configuration, desired.encode())]).await?;
        self.uncommitted_configuration_index = Some(index);
        let dispatches = self.broadcast_append_entries(storage, false)?;
        Ok((index, dispatches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerRole;

    async fn test_storage() -> LogStorage {
        let dir = tempfile::tempdir().unwrap();
        // Leaked on purpose: the backing directory must outlive the test
        // function without an explicit lifetime thread-through, and these
        // are short-lived test processes.
        let path = dir.into_path();
        LogStorage::load(path, RaftConfig::default()).await.unwrap()
    }

    fn three_node_configuration(self_id: ServerId) -> Configuration {
        let mut c = Configuration::new();
        for id in [1, 2, 3] {
            c.add(id, format!("127.0.0.1:{id}"), ServerRole::Voter).unwrap();
        }
        let _ = self_id;
        c
    }

    #[tokio::test]
    async fn new_instance_starts_unavailable_then_activates() {
        let module = ConsensusModule::new(1, three_node_configuration(1), RaftConfig::default());
        assert_eq!(module.role_name(), "unavailable");
    }

    #[tokio::test]
    async fn election_timeout_produces_vote_requests_to_every_peer() {
        let mut storage = test_storage().await;
        let mut module = ConsensusModule::new(1, three_node_configuration(1), RaftConfig::default());
        module.activate();

        let dispatches = module.on_election_timeout(&mut storage, Instant::now()).await.unwrap();
        assert_eq!(dispatches.len(), 2);
        assert!(matches!(module.role_name(), "candidate" | "pre-candidate"));
    }

    #[tokio::test]
    async fn collecting_a_majority_makes_the_candidate_leader() {
        let mut storage = test_storage().await;
        let mut cfg = RaftConfig::default();
        cfg.pre_vote = false;
        let mut module = ConsensusModule::new(1, three_node_configuration(1), cfg);
        module.activate();
        module.on_election_timeout(&mut storage, Instant::now()).await.unwrap();

        let term = storage.current_term();
        module
            .handle_request_vote_response(&mut storage, 2, RequestVoteResponse { term, vote_granted: true })
            .await
            .unwrap();

        assert!(module.is_leader());
        assert_eq!(storage.index.last_index(), 1); // the barrier entry
    }

    #[tokio::test]
    async fn higher_term_forces_step_down() {
        let mut storage = test_storage().await;
        let mut cfg = RaftConfig::default();
        cfg.pre_vote = false;
        let mut module = ConsensusModule::new(1, three_node_configuration(1), cfg);
        module.activate();
        module.on_election_timeout(&mut storage, Instant::now()).await.unwrap();
        let term = storage.current_term();
        module
            .handle_request_vote_response(&mut storage, 2, RequestVoteResponse { term, vote_granted: true })
            .await
            .unwrap();
        assert!(module.is_leader());

        module
            .handle_append_entries(
                &mut storage,
                AppendEntriesRequest {
                    term: term + 1,
                    leader_id: 3,
                    prev_log_index: storage.index.last_index(),
                    prev_log_term: storage.index.last_term(),
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await
            .unwrap();
        assert!(!module.is_leader());
        assert_eq!(storage.current_term(), term + 1);
    }

    #[tokio::test]
    async fn propose_command_rejected_when_not_leader() {
        let mut storage = test_storage().await;
        let mut module = ConsensusModule::new(1, three_node_configuration(1), RaftConfig::default());
        module.activate();
        let err = module.propose_command(&mut storage, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn configuration_change_busy_until_own_term_entry_commits() {
        let mut storage = test_storage().await;
        let mut cfg = RaftConfig::default();
        cfg.pre_vote = false;
        let mut module = ConsensusModule::new(1, three_node_configuration(1), cfg);
        module.activate();
        module.on_election_timeout(&mut storage, Instant::now()).await.unwrap();
        let term = storage.current_term();
        module
            .handle_request_vote_response(&mut storage, 2, RequestVoteResponse { term, vote_granted: true })
            .await
            .unwrap();
        assert!(module.is_leader());

        let mut desired = three_node_configuration(1);
        desired.add(4, "127.0.0.1:4", ServerRole::StandBy).unwrap();
        let err = module.propose_configuration_change(&mut storage, desired.clone()).await.unwrap_err();
        assert!(matches!(err, RaftError::ConfigurationBusy));

        // Simulate the barrier entry committing via replication replies.
        let ctx = AppendReplyContext { term, last_sent_index: 1 };
        module
            .handle_append_entries_response(&mut storage, 2, AppendEntriesResponse { term, success: true, last_log_index: None }, ctx)
            .await
            .unwrap();
        module
            .handle_append_entries_response(&mut storage, 3, AppendEntriesResponse { term, success: true, last_log_index: None }, ctx)
            .await
            .unwrap();
        assert_eq!(module.commit_index(), 1);

        let (index, _) = module.propose_configuration_change(&mut storage, desired).await.unwrap();
        assert_eq!(index, 2);
    }
}

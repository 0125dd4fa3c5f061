//! The driving loop: the one task per server that owns a
//! [`ConsensusModule`], its [`LogStorage`], and the caller's [`Fsm`], and
//! cooperatively multiplexes timers, inbound RPCs, RPC replies, and client
//! proposals over a single `tokio::select!`. Nothing outside this loop ever
//! mutates consensus state directly — callers only ever go through a
//! [`RaftHandle`].
//!
//! This mirrors the single-threaded actor shape `dennisss-repo`'s original
//! `Node::start` used (one task driving a channel of inbound events), just
//! rebuilt on `tokio::select!`/`mpsc` instead of the legacy `futures 0.1`
//! combinator chains.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;
use tracing::warn;

use crate::apply::{self, Applied};
use crate::config::RaftConfig;
use crate::configuration::Configuration;
use crate::consensus::ConsensusModule;
use crate::error::{RaftError, Result};
use crate::fsm::Fsm;
use crate::metrics::{self, RaftMetricsSnapshot};
use crate::replication::AppendReplyContext;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Dispatch, InstallSnapshotRequest, InstallSnapshotResponse,
    OutgoingMessage, RaftTransport, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use crate::snapshot_coordinator;
use crate::storage::snapshot as snapshot_file;
use crate::storage::LogStorage;
use crate::types::{LogIndex, ServerId};

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Every event the driving loop reacts to besides its own timers.
pub enum Command {
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    InstallSnapshot(InstallSnapshotRequest, oneshot::Sender<InstallSnapshotResponse>),
    TimeoutNow(TimeoutNowRequest),
    VoteReply(ServerId, RequestVoteResponse),
    AppendReply(ServerId, AppendEntriesResponse, AppendReplyContext),
    InstallSnapshotReply(ServerId, InstallSnapshotResponse, LogIndex),
    Propose(Vec<u8>, oneshot::Sender<Result<Vec<u8>>>),
    ProposeConfigurationChange(Configuration, oneshot::Sender<Result<LogIndex>>),
    Shutdown(oneshot::Sender<()>),
}

/// What the run loop does after handling one [`Command`].
enum Outcome {
    Continue { reset_election_timer: bool },
    Shutdown,
}

/// A cheaply cloneable front door to a running [`RaftServer`]. This is the
/// only thing a host process (its transport layer, its client API) ever
/// touches; the server task itself is not `Send`-exposed.
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    metrics_rx: watch::Receiver<RaftMetricsSnapshot>,
}

impl RaftHandle {
    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| RaftError::ShutdownInProgress)?;
        rx.await.map_err(|_| RaftError::ShutdownInProgress)
    }

    /// Entry point for a transport implementation that just decoded an
    /// inbound `RequestVote` off the wire.
    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|tx| Command::RequestVote(req, tx)).await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|tx| Command::AppendEntries(req, tx)).await
    }

    pub async fn install_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.call(|tx| Command::InstallSnapshot(req, tx)).await
    }

    pub async fn timeout_now(&self, req: TimeoutNowRequest) -> Result<()> {
        self.command_tx
            .send(Command::TimeoutNow(req))
            .await
            .map_err(|_| RaftError::ShutdownInProgress)
    }

    /// Proposes a command, resolving once it has been applied to the FSM
    /// (or failing with [`RaftError::LeadershipLost`] if this server loses
    /// leadership before that happens).
    pub async fn propose(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Propose(payload, tx))
            .await
            .map_err(|_| RaftError::ShutdownInProgress)?;
        rx.await.map_err(|_| RaftError::ShutdownInProgress)?
    }

    /// Proposes a configuration change, resolving with the log index the
    /// change was appended at once the proposal itself is accepted (not
    /// once it commits — see `ConsensusModule::propose_configuration_change`).
    pub async fn propose_configuration_change(&self, desired: Configuration) -> Result<LogIndex> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::ProposeConfigurationChange(desired, tx))
            .await
            .map_err(|_| RaftError::ShutdownInProgress)?;
        rx.await.map_err(|_| RaftError::ShutdownInProgress)?
    }

    /// The most recently published metrics snapshot.
    pub fn metrics(&self) -> RaftMetricsSnapshot {
        self.metrics_rx.borrow().clone()
    }

    /// Waits for the next metrics publication and returns it.
    pub async fn metrics_changed(&mut self) -> Result<RaftMetricsSnapshot> {
        self.metrics_rx.changed().await.map_err(|_| RaftError::ShutdownInProgress)?;
        Ok(self.metrics_rx.borrow().clone())
    }

    /// Requests an orderly shutdown and waits for the driving loop to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| RaftError::ShutdownInProgress)?;
        rx.await.map_err(|_| RaftError::ShutdownInProgress)
    }
}

/// Owns one server's consensus state, log, and FSM for the lifetime of the
/// process. Constructed via [`RaftServer::start`], which spawns the loop
/// and hands back a [`RaftHandle`].
pub struct RaftServer<F: Fsm, T: RaftTransport> {
    id: ServerId,
    dir: PathBuf,
    consensus: ConsensusModule,
    storage: LogStorage,
    fsm: F,
    transport: Arc<T>,
    config: RaftConfig,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    metrics_tx: watch::Sender<RaftMetricsSnapshot>,
    pending_commands: BTreeMap<LogIndex, oneshot::Sender<Result<Vec<u8>>>>,
}

impl<F: Fsm, T: RaftTransport> RaftServer<F, T> {
    /// Loads storage from `dir`, restores the FSM from the latest durable
    /// snapshot (if any), activates the consensus module with
    /// `configuration` as its starting view, and spawns the driving loop as
    /// a background task. Mirrors the lifecycle: construct, load, restore,
    /// then `activate` before anything is allowed to touch the network.
    pub async fn start(
        id: ServerId,
        dir: PathBuf,
        configuration: Configuration,
        config: RaftConfig,
        mut fsm: F,
        transport: Arc<T>,
    ) -> Result<RaftHandle> {
        let config = config.validate()?;
        let storage = LogStorage::load(dir.clone(), config.clone()).await?;
        let mut consensus = ConsensusModule::new(id, configuration, config.clone());
        if let Some(metadata) = snapshot_coordinator::restore_latest(&mut fsm, &dir).await? {
            consensus.restore_from_snapshot(metadata.last_included_index, metadata.configuration);
        }
        consensus.activate();

        let (command_tx, command_rx) = mpsc::channel(256);
        let initial_metrics = RaftMetricsSnapshot {
            id,
            role: consensus.role_name(),
            current_term: storage.current_term(),
            commit_index: consensus.commit_index(),
            last_applied: consensus.last_applied(),
            leader_hint: consensus.leader_hint(),
        };
        let (metrics_tx, metrics_rx) = metrics::channel(initial_metrics);

        let server = RaftServer {
            id,
            dir,
            consensus,
            storage,
            fsm,
            transport,
            config,
            command_tx: command_tx.clone(),
            command_rx,
            metrics_tx,
            pending_commands: BTreeMap::new(),
        };

        tokio::spawn(server.run());
        Ok(RaftHandle { command_tx, metrics_rx })
    }

    async fn run(mut self) {
        let mut election_deadline = TokioInstant::now() + self.consensus.election_timeout();
        let mut heartbeat_deadline = TokioInstant::now() + self.config.heartbeat_timeout;

        loop {
            let is_leader = self.consensus.is_leader();
            tokio::select! {
                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    match self.consensus.on_election_timeout(&mut self.storage, Instant::now()).await {
                        Ok(dispatches) => self.fan_out(dispatches),
                        Err(e) => self.fail_fatal(e),
                    }
                    election_deadline = TokioInstant::now() + self.consensus.election_timeout();
                }
                _ = tokio::time::sleep_until(heartbeat_deadline), if is_leader => {
                    match self.consensus.on_heartbeat_timeout(&mut self.storage) {
                        Ok(dispatches) => self.fan_out(dispatches),
                        Err(e) => self.fail_fatal(e),
                    }
                    heartbeat_deadline = TokioInstant::now() + self.config.heartbeat_timeout;
                }
                _ = self.storage.pool_drive(), if self.storage.pool_is_preparing() => {}
                maybe_cmd = self.command_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    match self.handle_command(cmd).await {
                        Outcome::Shutdown => break,
                        Outcome::Continue { reset_election_timer } => {
                            if reset_election_timer {
                                election_deadline = TokioInstant::now() + self.consensus.election_timeout();
                            }
                        }
                    }
                }
            }

            self.run_applies_and_snapshot().await;
            self.publish_metrics();
        }

        self.storage.close().await;
    }

    async fn handle_command(&mut self, cmd: Command) -> Outcome {
        match cmd {
            Command::RequestVote(req, reply) => {
                let mut reset = false;
                match self.consensus.handle_request_vote(&mut self.storage, req).await {
                    Ok(resp) => {
                        reset = resp.vote_granted;
                        let _ = reply.send(resp);
                    }
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: reset }
            }
            Command::AppendEntries(req, reply) => {
                let mut reset = false;
                match self.consensus.handle_append_entries(&mut self.storage, req).await {
                    Ok(resp) => {
                        reset = resp.success;
                        let _ = reply.send(resp);
                    }
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: reset }
            }
            Command::InstallSnapshot(req, reply) => {
                match self.consensus.handle_install_snapshot(&mut self.storage, req.clone()).await {
                    Ok(resp) => {
                        if let Err(e) =
                            snapshot_coordinator::receive_snapshot(&mut self.storage, &mut self.fsm, &self.dir, &req, unix_timestamp()).await
                        {
                            self.fail_fatal(e);
                        }
                        let _ = reply.send(resp);
                    }
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: true }
            }
            Command::TimeoutNow(req) => {
                match self.consensus.handle_timeout_now(&mut self.storage, req).await {
                    Ok(dispatches) => self.fan_out(dispatches),
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::VoteReply(from, resp) => {
                match self.consensus.handle_request_vote_response(&mut self.storage, from, resp).await {
                    Ok(dispatches) => self.fan_out(dispatches),
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::AppendReply(from, resp, ctx) => {
                let was_leader = self.consensus.is_leader();
                match self.consensus.handle_append_entries_response(&mut self.storage, from, resp, ctx).await {
                    Ok(dispatches) => self.fan_out(dispatches),
                    Err(e) => self.fail_fatal(e),
                }
                if was_leader && !self.consensus.is_leader() {
                    self.fail_pending_commands(|| RaftError::LeadershipLost);
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::InstallSnapshotReply(from, resp, last_included_index) => {
                match self
                    .consensus
                    .handle_install_snapshot_response(&mut self.storage, from, resp, last_included_index)
                    .await
                {
                    Ok(dispatches) => self.fan_out(dispatches),
                    Err(e) => self.fail_fatal(e),
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::Propose(payload, reply) => {
                match self.consensus.propose_command(&mut self.storage, payload).await {
                    Ok((index, dispatches)) => {
                        self.pending_commands.insert(index, reply);
                        self.fan_out(dispatches);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::ProposeConfigurationChange(desired, reply) => {
                match self.consensus.propose_configuration_change(&mut self.storage, desired).await {
                    Ok((index, dispatches)) => {
                        let _ = reply.send(Ok(index));
                        self.fan_out(dispatches);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Outcome::Continue { reset_election_timer: false }
            }
            Command::Shutdown(reply) => {
                self.fail_pending_commands(|| RaftError::ShutdownInProgress);
                let _ = reply.send(());
                Outcome::Shutdown
            }
        }
    }

    fn fail_fatal(&mut self, err: RaftError) {
        self.consensus.mark_unavailable(err.to_string());
    }

    fn fail_pending_commands(&mut self, make_err: impl Fn() -> RaftError) {
        for (_, tx) in std::mem::take(&mut self.pending_commands) {
            let _ = tx.send(Err(make_err()));
        }
    }

    fn fan_out(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            self.spawn_dispatch(dispatch);
        }
    }

    /// Sends one RPC on a detached task and feeds the reply back in as a
    /// `Command` so the driving loop is the only place consensus state is
    /// ever touched.
    fn spawn_dispatch(&self, dispatch: Dispatch) {
        let Dispatch { to, message } = dispatch;
        let transport = self.transport.clone();
        let command_tx = self.command_tx.clone();
        match message {
            OutgoingMessage::RequestVote(req) => {
                tokio::spawn(async move {
                    if let Ok(resp) = transport.send_request_vote(to, req).await {
                        let _ = command_tx.send(Command::VoteReply(to, resp)).await;
                    }
                });
            }
            OutgoingMessage::AppendEntries { request, last_sent_index } => {
                let ctx = AppendReplyContext { term: request.term, last_sent_index };
                tokio::spawn(async move {
                    if let Ok(resp) = transport.send_append_entries(to, request).await {
                        let _ = command_tx.send(Command::AppendReply(to, resp, ctx)).await;
                    }
                });
            }
            OutgoingMessage::InstallSnapshot(req) => {
                let last_included_index = req.last_included_index;
                tokio::spawn(async move {
                    if let Ok(resp) = transport.send_install_snapshot(to, req).await {
                        let _ = command_tx.send(Command::InstallSnapshotReply(to, resp, last_included_index)).await;
                    }
                });
            }
            OutgoingMessage::TimeoutNow(req) => {
                tokio::spawn(async move {
                    let _ = transport.send_timeout_now(to, req).await;
                });
            }
        }
    }

    /// Runs the apply loop, resolving any pending client proposals that
    /// just got applied, then checks whether a snapshot is due and streams
    /// one to any follower stuck behind a compacted prefix.
    async fn run_applies_and_snapshot(&mut self) {
        match apply::run_applies(&mut self.consensus, &self.storage, &mut self.fsm).await {
            Ok(applied) => {
                for outcome in applied {
                    if let Applied::Command { index, result } = outcome {
                        if let Some(reply) = self.pending_commands.remove(&index) {
                            let _ = reply.send(Ok(result));
                        }
                    }
                }
            }
            Err(e) => self.fail_fatal(e),
        }

        if snapshot_coordinator::should_snapshot(&self.storage, &self.config) {
            let dir = self.dir.clone();
            match snapshot_coordinator::take_snapshot(&mut self.consensus, &mut self.storage, &self.fsm, &self.config, &dir, unix_timestamp())
                .await
            {
                Ok(_path) => {}
                Err(e) => warn!(server_id = self.id, error = %e, "snapshot attempt failed"),
            }
        }

        let needing = self.consensus.followers_needing_snapshot();
        if !needing.is_empty() {
            self.send_pending_snapshots(needing).await;
        }
    }

    /// Streams the latest on-disk snapshot to every follower the consensus
    /// module flagged as stuck behind a compacted prefix. If none exists
    /// yet (a brand-new leader with nothing snapshotted), the follower's
    /// pending flag is cleared so it gets reconsidered on a later tick.
    async fn send_pending_snapshots(&mut self, needing: Vec<ServerId>) {
        let latest = match snapshot_file::find_latest(&self.dir).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(server_id = self.id, error = %e, "failed to look up latest snapshot");
                for id in needing {
                    self.consensus.clear_request_pending(id);
                }
                return;
            }
        };
        let Some(path) = latest else {
            for id in needing {
                self.consensus.clear_request_pending(id);
            }
            return;
        };
        let snapshot = match snapshot_file::read(&path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(server_id = self.id, error = %e, "failed to read latest snapshot");
                for id in needing {
                    self.consensus.clear_request_pending(id);
                }
                return;
            }
        };

        for id in needing {
            let req = InstallSnapshotRequest {
                term: self.storage.current_term(),
                leader_id: self.id,
                last_included_index: snapshot.metadata.last_included_index,
                last_included_term: snapshot.metadata.last_included_term,
                configuration: snapshot.metadata.configuration.encode(),
                data: snapshot.fsm_state.clone(),
            };
            self.spawn_dispatch(Dispatch { to: id, message: OutgoingMessage::InstallSnapshot(req) });
        }
    }

    fn publish_metrics(&self) {
        let snapshot = RaftMetricsSnapshot {
            id: self.id,
            role: self.consensus.role_name(),
            current_term: self.storage.current_term(),
            commit_index: self.consensus.commit_index(),
            last_applied: self.consensus.last_applied(),
            leader_hint: self.consensus.leader_hint(),
        };
        let _ = self.metrics_tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerRole;

    struct NoopFsm;

    impl Fsm for NoopFsm {
        fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Result<Vec<u8>> {
            Ok(command.to_vec())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn restore(&mut self, _state: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct LoopbackTransport;

    impl RaftTransport for LoopbackTransport {
        async fn send_request_vote(&self, _to: ServerId, _req: RequestVoteRequest) -> Result<RequestVoteResponse> {
            Err(RaftError::Canceled)
        }

        async fn send_append_entries(&self, _to: ServerId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            Err(RaftError::Canceled)
        }

        async fn send_install_snapshot(&self, _to: ServerId, _req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
            Err(RaftError::Canceled)
        }

        async fn send_timeout_now(&self, _to: ServerId, _req: TimeoutNowRequest) -> Result<()> {
            Err(RaftError::Canceled)
        }
    }

    fn one_voter_configuration(id: ServerId) -> Configuration {
        let mut c = Configuration::new();
        c.add(id, "127.0.0.1:1", ServerRole::Voter).unwrap();
        c
    }

    #[tokio::test]
    async fn single_voter_server_elects_itself_and_applies_a_proposal() {
        let dir = tempfile::tempdir().unwrap();
        let handle = RaftServer::start(
            1,
            dir.path().to_path_buf(),
            one_voter_configuration(1),
            RaftConfig { election_timeout: std::time::Duration::from_millis(30), heartbeat_timeout: std::time::Duration::from_millis(10), ..Default::default() },
            NoopFsm,
            Arc::new(LoopbackTransport),
        )
        .await
        .unwrap();

        // A lone voter wins its own election as soon as the timer fires;
        // wait past it, then propose a command and expect it to round-trip
        // through the FSM.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle.propose(b"hello".to_vec()))
            .await
            .expect("propose should not hang")
            .unwrap();
        assert_eq!(result, b"hello");

        let metrics = handle.metrics();
        assert_eq!(metrics.role, "leader");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_snapshot_seeds_applied_progress_and_restores_fsm() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct RecordingFsm {
            restored: std::sync::Arc<Mutex<Option<Vec<u8>>>>,
        }

        impl Fsm for RecordingFsm {
            fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Result<Vec<u8>> {
                Ok(command.to_vec())
            }

            fn snapshot(&self) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }

            fn restore(&mut self, state: &[u8]) -> Result<()> {
                *self.restored.lock().unwrap() = Some(state.to_vec());
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let snapshot = crate::storage::snapshot::SnapshotFile {
            metadata: crate::storage::snapshot::SnapshotMetadata {
                last_included_index: 5,
                last_included_term: 1,
                configuration: one_voter_configuration(1),
            },
            fsm_state: b"restored-state".to_vec(),
        };
        crate::storage::snapshot::write_atomic(dir.path(), &snapshot, 1).await.unwrap();

        let restored = std::sync::Arc::new(Mutex::new(None));
        let fsm = RecordingFsm { restored: restored.clone() };
        let handle = RaftServer::start(
            1,
            dir.path().to_path_buf(),
            one_voter_configuration(1),
            RaftConfig::default(),
            fsm,
            Arc::new(LoopbackTransport),
        )
        .await
        .unwrap();

        let metrics = handle.metrics();
        assert_eq!(metrics.last_applied, 5);
        assert_eq!(metrics.commit_index, 5);
        assert_eq!(restored.lock().unwrap().as_deref(), Some(b"restored-state".as_slice()));
        handle.shutdown().await.unwrap();
    }
}

//! In-process simulated cluster: exercises election safety, leader
//! append-only, log matching, commit durability, apply order, and term
//! monotonicity without any real transport or wall-clock timers.
//!
//! Every node's storage is still the real [`LogStorage`] (a tempdir per
//! node); only message delivery is simulated — dispatches go onto a plain
//! `VecDeque` and are drained synchronously instead of crossing a
//! [`crate::rpc::RaftTransport`]. This is the same shape
//! `byronwasti-openraft`'s in-memory storage tests use to drive `openraft`
//! without a network, adapted to this crate's dispatch/reply split.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::apply;
use crate::config::RaftConfig;
use crate::configuration::Configuration;
use crate::consensus::ConsensusModule;
use crate::error::Result;
use crate::fsm::Fsm;
use crate::replication::AppendReplyContext;
use crate::rpc::{
    AppendEntriesResponse, Dispatch, InstallSnapshotResponse, OutgoingMessage, RequestVoteResponse,
};
use crate::storage::LogStorage;
use crate::types::{LogIndex, ServerId, ServerRole, Term};

/// Records every command it applies, in the order it applied them.
pub struct RecordingFsm {
    pub applied: Vec<Vec<u8>>,
}

impl RecordingFsm {
    pub fn new() -> Self {
        RecordingFsm { applied: Vec::new() }
    }
}

impl Fsm for RecordingFsm {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Result<Vec<u8>> {
        self.applied.push(command.to_vec());
        Ok(command.to_vec())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.applied.concat())
    }

    fn restore(&mut self, _state: &[u8]) -> Result<()> {
        Ok(())
    }
}

struct Node {
    id: ServerId,
    consensus: ConsensusModule,
    storage: LogStorage,
    fsm: RecordingFsm,
}

/// A single in-flight message, tagged with who sent it so partitions can be
/// simulated by dropping anything touching an isolated node on either end.
enum Event {
    Request { sender: ServerId, dispatch: Dispatch },
    VoteReply { responder: ServerId, to: ServerId, resp: RequestVoteResponse },
    AppendReply { responder: ServerId, to: ServerId, resp: AppendEntriesResponse, ctx: AppendReplyContext },
    InstallSnapshotReply { responder: ServerId, to: ServerId, resp: InstallSnapshotResponse, last_included_index: LogIndex },
}

/// A cluster of in-process voters wired together by hand. Tests drive it
/// one deterministic step at a time: trigger an election or a proposal,
/// then [`Cluster::drain`] the resulting message traffic to quiescence.
pub struct Cluster {
    nodes: Vec<Node>,
    partitioned: HashSet<ServerId>,
    queue: VecDeque<Event>,
}

impl Cluster {
    pub async fn new(n_voters: usize, config: RaftConfig) -> Cluster {
        let mut configuration = Configuration::new();
        for id in 1..=n_voters as ServerId {
            configuration.add(id, format!("127.0.0.1:{id}"), ServerRole::Voter).unwrap();
        }

        let mut nodes = Vec::new();
        for id in 1..=n_voters as ServerId {
            let dir = tempfile::tempdir().unwrap().into_path();
            let storage = LogStorage::load(dir, config.clone()).await.unwrap();
            let mut consensus = ConsensusModule::new(id, configuration.copy(), config.clone());
            consensus.activate();
            nodes.push(Node { id, consensus, storage, fsm: RecordingFsm::new() });
        }

        Cluster { nodes, partitioned: HashSet::new(), queue: VecDeque::new() }
    }

    fn index_of(&self, id: ServerId) -> usize {
        self.nodes.iter().position(|n| n.id == id).expect("unknown node id")
    }

    pub fn partition(&mut self, id: ServerId) {
        self.partitioned.insert(id);
    }

    pub fn heal(&mut self, id: ServerId) {
        self.partitioned.remove(&id);
    }

    pub fn is_leader(&self, id: ServerId) -> bool {
        self.nodes[self.index_of(id)].consensus.is_leader()
    }

    pub fn leaders(&self) -> Vec<ServerId> {
        self.nodes.iter().filter(|n| n.consensus.is_leader()).map(|n| n.id).collect()
    }

    pub fn commit_index(&self, id: ServerId) -> LogIndex {
        self.nodes[self.index_of(id)].consensus.commit_index()
    }

    pub fn term(&self, id: ServerId) -> Term {
        self.nodes[self.index_of(id)].storage.current_term()
    }

    pub fn applied(&self, id: ServerId) -> &[Vec<u8>] {
        &self.nodes[self.index_of(id)].fsm.applied
    }

    pub fn last_log_index(&self, id: ServerId) -> LogIndex {
        self.nodes[self.index_of(id)].storage.index.last_index()
    }

    /// Fires the election timer on `id` without draining the resulting
    /// traffic yet — lets a test start two campaigns "simultaneously"
    /// before anyone has heard from the other.
    pub async fn trigger_election_timeout(&mut self, id: ServerId) {
        let idx = self.index_of(id);
        let dispatches = self.nodes[idx]
            .consensus
            .on_election_timeout(&mut self.nodes[idx].storage, Instant::now())
            .await
            .unwrap();
        self.enqueue(id, dispatches);
    }

    /// Fires the election timer on `id` and drains all resulting traffic.
    pub async fn elect(&mut self, id: ServerId) {
        self.trigger_election_timeout(id).await;
        self.drain().await;
    }

    /// Proposes a command on `id` (which must currently be leader),
    /// drains replication traffic, then runs the apply loop on every node
    /// so `applied()` reflects anything that just committed.
    pub async fn propose(&mut self, id: ServerId, payload: Vec<u8>) -> Result<LogIndex> {
        let idx = self.index_of(id);
        let (index, dispatches) = self.nodes[idx].consensus.propose_command(&mut self.nodes[idx].storage, payload).await?;
        self.enqueue(id, dispatches);
        self.drain().await;
        self.apply_all().await;
        Ok(index)
    }

    /// Fires the heartbeat timer on `id` and drains all resulting traffic,
    /// then applies on every node. Useful to push a stalled commit index
    /// forward after a partition heals.
    pub async fn heartbeat(&mut self, id: ServerId) {
        let idx = self.index_of(id);
        let dispatches = self.nodes[idx].consensus.on_heartbeat_timeout(&mut self.nodes[idx].storage).unwrap();
        self.enqueue(id, dispatches);
        self.drain().await;
        self.apply_all().await;
    }

    pub async fn apply_all(&mut self) {
        for node in &mut self.nodes {
            let _ = apply::run_applies(&mut node.consensus, &node.storage, &mut node.fsm).await;
        }
    }

    fn enqueue(&mut self, sender: ServerId, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            self.queue.push_back(Event::Request { sender, dispatch });
        }
    }

    /// Drains the event queue to quiescence. Bounded so a latent protocol
    /// bug that reintroduces an unthrottled resend loop fails the test
    /// instead of hanging it.
    pub async fn drain(&mut self) {
        let mut processed = 0;
        while let Some(event) = self.queue.pop_front() {
            self.process(event).await;
            processed += 1;
            assert!(processed < 10_000, "event queue did not quiesce: possible unthrottled resend loop");
        }
    }

    async fn process(&mut self, event: Event) {
        match event {
            Event::Request { sender, dispatch } => {
                if self.partitioned.contains(&sender) || self.partitioned.contains(&dispatch.to) {
                    return;
                }
                let receiver = dispatch.to;
                let ridx = self.index_of(receiver);
                match dispatch.message {
                    OutgoingMessage::RequestVote(req) => {
                        let resp = self.nodes[ridx]
                            .consensus
                            .handle_request_vote(&mut self.nodes[ridx].storage, req)
                            .await
                            .unwrap();
                        self.queue.push_back(Event::VoteReply { responder: receiver, to: sender, resp });
                    }
                    OutgoingMessage::AppendEntries { request, last_sent_index } => {
                        let ctx = AppendReplyContext { term: request.term, last_sent_index };
                        let resp = self.nodes[ridx]
                            .consensus
                            .handle_append_entries(&mut self.nodes[ridx].storage, request)
                            .await
                            .unwrap();
                        self.queue.push_back(Event::AppendReply { responder: receiver, to: sender, resp, ctx });
                    }
                    OutgoingMessage::InstallSnapshot(req) => {
                        let last_included_index = req.last_included_index;
                        let resp = self.nodes[ridx]
                            .consensus
                            .handle_install_snapshot(&mut self.nodes[ridx].storage, req)
                            .await
                            .unwrap();
                        self.queue.push_back(Event::InstallSnapshotReply {
                            responder: receiver,
                            to: sender,
                            resp,
                            last_included_index,
                        });
                    }
                    OutgoingMessage::TimeoutNow(req) => {
                        let dispatches = self.nodes[ridx]
                            .consensus
                            .handle_timeout_now(&mut self.nodes[ridx].storage, req)
                            .await
                            .unwrap();
                        self.enqueue(receiver, dispatches);
                    }
                }
            }
            Event::VoteReply { responder, to, resp } => {
                if self.partitioned.contains(&responder) || self.partitioned.contains(&to) {
                    return;
                }
                let idx = self.index_of(to);
                let dispatches = self.nodes[idx]
                    .consensus
                    .handle_request_vote_response(&mut self.nodes[idx].storage, responder, resp)
                    .await
                    .unwrap();
                self.enqueue(to, dispatches);
            }
            Event::AppendReply { responder, to, resp, ctx } => {
                if self.partitioned.contains(&responder) || self.partitioned.contains(&to) {
                    return;
                }
                let idx = self.index_of(to);
                let dispatches = self.nodes[idx]
                    .consensus
                    .handle_append_entries_response(&mut self.nodes[idx].storage, responder, resp, ctx)
                    .await
                    .unwrap();
                self.enqueue(to, dispatches);
            }
            Event::InstallSnapshotReply { responder, to, resp, last_included_index } => {
                if self.partitioned.contains(&responder) || self.partitioned.contains(&to) {
                    return;
                }
                let idx = self.index_of(to);
                let dispatches = self.nodes[idx]
                    .consensus
                    .handle_install_snapshot_response(&mut self.nodes[idx].storage, responder, resp, last_included_index)
                    .await
                    .unwrap();
                self.enqueue(to, dispatches);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RaftConfig {
        RaftConfig { pre_vote: false, ..Default::default() }
    }

    /// Election safety (P1): at most one leader can be elected per term,
    /// even when two candidates campaign in the same term simultaneously
    /// (neither has heard from the other yet when both start).
    #[tokio::test]
    async fn at_most_one_leader_per_term() {
        let mut cluster = Cluster::new(3, fast_config()).await;
        cluster.trigger_election_timeout(1).await;
        cluster.trigger_election_timeout(2).await;
        cluster.drain().await;

        assert!(cluster.leaders().len() <= 1, "a split vote must not produce two leaders in the same term");
    }

    /// Commit durability (P4) + apply order (P5): a command committed by a
    /// three-node cluster is applied, in order, on every node once it
    /// catches up.
    #[tokio::test]
    async fn committed_commands_apply_in_order_on_every_node() {
        let mut cluster = Cluster::new(3, fast_config()).await;
        cluster.elect(1).await;

        cluster.propose(1, b"a".to_vec()).await.unwrap();
        cluster.propose(1, b"b".to_vec()).await.unwrap();
        cluster.propose(1, b"c".to_vec()).await.unwrap();
        assert_eq!(cluster.commit_index(1), 4); // barrier + 3 commands

        // A commit index only reaches a follower on its *next* AppendEntries
        // which nothing further triggers once everyone is caught
        // up; one heartbeat carries the final advance through.
        cluster.heartbeat(1).await;
        for id in [1, 2, 3] {
            assert_eq!(cluster.commit_index(id), 4);
            assert_eq!(cluster.applied(id), &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        }
    }

    /// Term monotonicity (P6): observing a higher term never lets a
    /// server's recorded term go backwards, even across a lost election.
    #[tokio::test]
    async fn term_never_goes_backwards_after_losing_an_election() {
        let mut cluster = Cluster::new(3, fast_config()).await;
        cluster.elect(1).await;
        let term_after_first_election = cluster.term(1);

        cluster.partition(1);
        cluster.elect(2).await;
        let term_after_second_election = cluster.term(2);
        assert!(term_after_second_election > term_after_first_election);

        cluster.heal(1);
        cluster.heartbeat(2).await;
        assert!(cluster.term(1) >= term_after_second_election);
        assert!(!cluster.is_leader(1), "the partitioned former leader must step down once it hears from the new one");
    }

    /// Leader append-only + log matching (P2/P3): a leader elected after a
    /// partition heals never needs to overwrite the new leader's entries —
    /// only the minority partition's conflicting ones get truncated, and
    /// every node ends up with an identical prefix.
    #[tokio::test]
    async fn logs_converge_after_a_partition_heals() {
        let mut cluster = Cluster::new(3, fast_config()).await;
        cluster.elect(1).await;
        cluster.propose(1, b"before-partition".to_vec()).await.unwrap();

        cluster.partition(3);
        cluster.propose(1, b"during-partition".to_vec()).await.unwrap();
        // Node 3 never saw this entry.
        assert!(cluster.last_log_index(3) < cluster.last_log_index(1));

        cluster.heal(3);
        cluster.heartbeat(1).await;
        assert_eq!(cluster.last_log_index(3), cluster.last_log_index(1));
        assert_eq!(cluster.commit_index(3), cluster.commit_index(1));
    }

    /// A single-voter cluster elects itself immediately and can commit
    /// without ever hearing from a peer (the degenerate n=1 case).
    #[tokio::test]
    async fn single_voter_cluster_commits_alone() {
        let mut cluster = Cluster::new(1, fast_config()).await;
        cluster.elect(1).await;
        assert!(cluster.is_leader(1));
        let index = cluster.propose(1, b"solo".to_vec()).await.unwrap();
        assert_eq!(cluster.commit_index(1), index);
        assert_eq!(cluster.applied(1), &[b"solo".to_vec()]);
    }
}

//! The apply loop: advances `last_applied` toward `commit_index`,
//! invoking the caller's [`Fsm`] for committed commands and installing
//! committed configurations.
//!
//! Apply is synchronous with respect to the state engine — the driving loop
//! in [`crate::server`] does not process another protocol step while
//! [`run_applies`] is awaited — but the FSM call itself may do its own
//! internal `spawn_blocking` if it needs to; this module makes no assumption
//! about that.

use tracing::{debug, instrument};

use crate::configuration::Configuration;
use crate::consensus::ConsensusModule;
use crate::error::{RaftError, Result};
use crate::fsm::Fsm;
use crate::log_entry::EntryType;
use crate::storage::LogStorage;
use crate::types::LogIndex;

/// The outcome of applying a single committed entry.
#[derive(Debug)]
pub enum Applied {
    /// A `command` entry: carries whatever the FSM returned.
    Command { index: LogIndex, result: Vec<u8> },
    /// A `configuration` entry: the new configuration is now committed.
    Configuration { index: LogIndex, configuration: Configuration },
    /// A `barrier` entry: nothing but `last_applied` moves.
    Barrier { index: LogIndex },
}

impl Applied {
    pub fn index(&self) -> LogIndex {
        match self {
            Applied::Command { index, .. } => *index,
            Applied::Configuration { index, .. } => *index,
            Applied::Barrier { index } => *index,
        }
    }
}

/// Applies every entry with index in `(last_applied, commit_index]`, in
/// order, returning one [`Applied`] per entry processed (empty if nothing
/// was newly committed).
#[instrument(skip(consensus, storage, fsm))]
pub async fn run_applies(consensus: &mut ConsensusModule, storage: &LogStorage, fsm: &mut dyn Fsm) -> Result<Vec<Applied>> {
    let mut applied = Vec::new();
    while consensus.last_applied() < consensus.commit_index() {
        let index = consensus.last_applied() + 1;
        let entry = storage
            .index
            .get(index)
            .map_err(|_| RaftError::Corrupt(format!("apply loop: committed entry {index} missing from log")))?;

        let outcome = match entry.entry_type {
            EntryType::Command => {
                let result = fsm.apply(index, &entry.payload)?;
                debug!(index, "applied command entry");
                Applied::Command { index, result }
            }
            EntryType::Configuration => {
                let configuration = Configuration::decode(&entry.payload)?;
                consensus.install_committed_configuration(index, configuration.clone());
                debug!(index, "installed committed configuration");
                Applied::Configuration { index, configuration }
            }
            EntryType::Barrier => {
                debug!(index, "advanced past barrier entry");
                Applied::Barrier { index }
            }
        };

        consensus.advance_last_applied(index);
        applied.push(outcome);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::configuration::Configuration as Config;
    use crate::types::ServerRole;

    struct RecordingFsm {
        applied: Vec<(LogIndex, Vec<u8>)>,
        snapshot_calls: usize,
        restore_calls: usize,
    }

    impl Fsm for RecordingFsm {
        fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>> {
            self.applied.push((index, command.to_vec()));
            Ok(command.to_vec())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn restore(&mut self, _state: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn three_node_configuration() -> Config {
        let mut c = Config::new();
        for id in [1, 2, 3] {
            c.add(id, format!("127.0.0.1:{id}"), ServerRole::Voter).unwrap();
        }
        c
    }

    async fn test_storage() -> LogStorage {
        let dir = tempfile::tempdir().unwrap().into_path();
        LogStorage::load(dir, RaftConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn applies_commands_in_order_and_advances_last_applied() {
        let mut storage = test_storage().await;
        storage
            .append_batch(vec![
                (1, EntryType::Command, b"a".to_vec()),
                (1, EntryType::Command, b"b".to_vec()),
                (1, EntryType::Barrier, Vec::new()),
            ])
            .await
            .unwrap();

        let mut consensus = ConsensusModule::new(1, three_node_configuration(), RaftConfig::default());
        consensus.activate();
        // commit_index is private outside the crate; exercise through the
        // public surface by driving a leader election and replication flow
        // is overkill here, so reach in via the crate-visible test seam.
        set_commit_index_for_test(&mut consensus, 3);

        let mut fsm = RecordingFsm { applied: Vec::new(), snapshot_calls: 0, restore_calls: 0 };
        let applied = run_applies(&mut consensus, &storage, &mut fsm).await.unwrap();

        assert_eq!(applied.len(), 3);
        assert_eq!(fsm.applied, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        assert_eq!(consensus.last_applied(), 3);
    }

    #[tokio::test]
    async fn applying_a_configuration_entry_installs_it_as_committed() {
        let mut storage = test_storage().await;
        let mut desired = three_node_configuration();
        desired.add(4, "127.0.0.1:4", ServerRole::StandBy).unwrap();
        storage.append_batch(vec![(1, EntryType::Configuration, desired.encode())]).await.unwrap();

        let mut consensus = ConsensusModule::new(1, three_node_configuration(), RaftConfig::default());
        consensus.activate();
        set_commit_index_for_test(&mut consensus, 1);

        let mut fsm = RecordingFsm { applied: Vec::new(), snapshot_calls: 0, restore_calls: 0 };
        let applied = run_applies(&mut consensus, &storage, &mut fsm).await.unwrap();

        assert_eq!(applied.len(), 1);
        assert!(matches!(&applied[0], Applied::Configuration { index: 1, .. }));
        assert_eq!(consensus.last_committed_configuration_index(), 1);
    }

    /// Test-only seam: the production path advances `commit_index` only via
    /// replication/quorum, which is exercised in `consensus`'s own tests;
    /// here we only need a stable way to pretend a given index is already
    /// committed.
    fn set_commit_index_for_test(consensus: &mut ConsensusModule, index: LogIndex) {
        consensus.commit_index = index;
    }
}

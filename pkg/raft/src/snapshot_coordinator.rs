//! The snapshot coordinator: decides when the leader or a follower
//! should take a snapshot, drives the FSM and storage through producing and
//! persisting one, and applies a received `InstallSnapshot` on this end.
//!
//! Kept distinct from [`crate::storage::snapshot`] (which only knows the
//! on-disk file format) the same way [`crate::consensus`] is kept distinct
//! from [`crate::storage`]: this module is the policy, storage is the
//! mechanism.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::RaftConfig;
use crate::configuration::Configuration;
use crate::consensus::ConsensusModule;
use crate::error::{RaftError, Result};
use crate::fsm::Fsm;
use crate::rpc::InstallSnapshotRequest;
use crate::storage::snapshot::{self, SnapshotFile, SnapshotMetadata};
use crate::storage::LogStorage;

/// True once the in-memory log has grown by at least `config.snapshot_threshold`
/// entries past `first_index`. Checked by the driving loop on
/// a cadence of its choosing — after every apply pass is a reasonable
/// default.
pub fn should_snapshot(storage: &LogStorage, config: &RaftConfig) -> bool {
    let first = storage.index.first_index();
    let last = storage.index.last_index();
    if first == 0 || last < first {
        return false;
    }
    last - first + 1 >= config.snapshot_threshold
}

/// Produces a snapshot of the FSM as of `consensus.last_applied()`, writes it
/// atomically to `dir`, and trims the log up to
/// `last_included_index - trailing`, widened (never narrowed) so the most
/// recently committed configuration is never trimmed out from under a
/// recovering follower (see DESIGN.md).
pub async fn take_snapshot(
    consensus: &mut ConsensusModule,
    storage: &mut LogStorage,
    fsm: &dyn Fsm,
    config: &RaftConfig,
    dir: &Path,
    timestamp: u64,
) -> Result<PathBuf> {
    let last_included_index = consensus.last_applied();
    let last_included_term = storage
        .index
        .term(last_included_index)
        .ok_or_else(|| RaftError::Corrupt(format!("snapshot: no term recorded for applied index {last_included_index}")))?;

    let snapshot = SnapshotFile {
        metadata: SnapshotMetadata {
            last_included_index,
            last_included_term,
            configuration: consensus.configuration_snapshot(),
        },
        fsm_state: fsm.snapshot()?,
    };
    let path = snapshot::write_atomic(dir, &snapshot, timestamp).await?;

    let trailing_floor = last_included_index.saturating_sub(config.snapshot_trailing);
    let config_floor = consensus.last_committed_configuration_index();
    let truncate_up_to = if config_floor > 0 && config_floor <= last_included_index {
        trailing_floor.min(config_floor.saturating_sub(1))
    } else {
        trailing_floor
    };

    info!(last_included_index, last_included_term, truncate_up_to, "took snapshot");
    storage.truncate_prefix(truncate_up_to).await?;
    Ok(path)
}

/// Restores the FSM from the most recent durable snapshot in `dir`, if any,
/// and returns its metadata so the caller can seed `commit_index`/
/// `last_applied` before the consensus module activates. Without this, a
/// restart after a snapshot that trimmed the log starts believing nothing
/// has ever been applied, and the apply loop faults the first time
/// `commit_index` advances past an index the snapshot already covers but
/// the (now-shorter) log no longer holds.
pub async fn restore_latest(fsm: &mut dyn Fsm, dir: &Path) -> Result<Option<SnapshotMetadata>> {
    let Some(path) = snapshot::find_latest(dir).await? else {
        return Ok(None);
    };
    let snapshot = snapshot::read(&path).await?;
    fsm.restore(&snapshot.fsm_state)?;
    Ok(Some(snapshot.metadata))
}

/// Applies a received `InstallSnapshot`: persists the
/// snapshot file (so a restart after this point sees it), restores the FSM
/// from the carried state, and compacts or discards the local log.
/// Term/leader bookkeeping is handled separately by
/// [`crate::consensus::ConsensusModule::handle_install_snapshot`], which
/// never touches the FSM directly.
pub async fn receive_snapshot(storage: &mut LogStorage, fsm: &mut dyn Fsm, dir: &Path, req: &InstallSnapshotRequest, timestamp: u64) -> Result<PathBuf> {
    let configuration = Configuration::decode(&req.configuration)?;
    let snapshot = SnapshotFile {
        metadata: SnapshotMetadata {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            configuration,
        },
        fsm_state: req.data.clone(),
    };
    let path = snapshot::write_atomic(dir, &snapshot, timestamp).await?;
    fsm.restore(&req.data)?;
    storage.install_snapshot(req.last_included_index).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::log_entry::EntryType;
    use crate::types::ServerRole;

    struct StubFsm {
        state: Vec<u8>,
    }

    impl Fsm for StubFsm {
        fn apply(&mut self, _index: crate::types::LogIndex, command: &[u8]) -> Result<Vec<u8>> {
            self.state = command.to_vec();
            Ok(Vec::new())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(self.state.clone())
        }

        fn restore(&mut self, state: &[u8]) -> Result<()> {
            self.state = state.to_vec();
            Ok(())
        }
    }

    fn one_voter_configuration() -> Configuration {
        let mut c = Configuration::new();
        c.add(1, "127.0.0.1:1", ServerRole::Voter).unwrap();
        c
    }

    #[test]
    fn trigger_fires_once_growth_exceeds_threshold() {
        let cfg = RaftConfig { snapshot_threshold: 3, ..Default::default() };
        let table_below = crate::log_index::LogIndexTable::from_entries(
            1,
            vec![crate::log_entry::LogEntry::new(1, 1, EntryType::Command, vec![])],
        );
        assert!(!trigger_over(&table_below, &cfg));

        let table_at = crate::log_index::LogIndexTable::from_entries(
            1,
            (1..=3)
                .map(|i| crate::log_entry::LogEntry::new(i, 1, EntryType::Command, vec![]))
                .collect(),
        );
        assert!(trigger_over(&table_at, &cfg));
    }

    fn trigger_over(table: &crate::log_index::LogIndexTable, cfg: &RaftConfig) -> bool {
        let first = table.first_index();
        let last = table.last_index();
        if first == 0 || last < first {
            return false;
        }
        last - first + 1 >= cfg.snapshot_threshold
    }

    #[tokio::test]
    async fn take_snapshot_writes_file_and_trims_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaftConfig { block_size: 64, blocks_per_segment: 4, snapshot_trailing: 1, ..Default::default() };
        let mut storage = LogStorage::load(dir.path().to_path_buf(), cfg.clone()).await.unwrap();
        for i in 0..5u8 {
            storage.append_batch(vec![(1, EntryType::Command, vec![i])]).await.unwrap();
        }

        let mut consensus = ConsensusModule::new(1, one_voter_configuration(), cfg.clone());
        consensus.activate();
        consensus.commit_index = 5;
        for _ in 0..5 {
            consensus.advance_last_applied(consensus.last_applied() + 1);
        }

        let fsm = StubFsm { state: b"state-at-5".to_vec() };
        let path = take_snapshot(&mut consensus, &mut storage, &fsm, &cfg, dir.path(), 1).await.unwrap();
        assert!(path.exists());

        // trailing=1 keeps index 5 (last_included) - 1 = 4 onward, so index
        // 4 and 5 should survive the truncation.
        assert!(storage.index.first_index() <= 5);
        let reloaded = snapshot::read(&path).await.unwrap();
        assert_eq!(reloaded.fsm_state, b"state-at-5");
        assert_eq!(reloaded.metadata.last_included_index, 5);
    }

    #[tokio::test]
    async fn receive_snapshot_restores_fsm_and_installs_into_storage() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaftConfig::default();
        let mut storage = LogStorage::load(dir.path().to_path_buf(), cfg.clone()).await.unwrap();
        storage.append_batch(vec![(1, EntryType::Command, vec![1])]).await.unwrap();

        let req = InstallSnapshotRequest {
            term: 1,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 1,
            configuration: one_voter_configuration().encode(),
            data: b"remote-state".to_vec(),
        };
        let mut fsm = StubFsm { state: Vec::new() };
        receive_snapshot(&mut storage, &mut fsm, dir.path(), &req, 1).await.unwrap();

        assert_eq!(fsm.state, b"remote-state");
        assert_eq!(storage.index.first_index(), 11);
    }
}

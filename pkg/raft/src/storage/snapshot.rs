//! On-disk snapshot files: `snapshot-<term>-<index>-<timestamp>`.
//!
//! A snapshot is made visible atomically: the payload is written to a
//! temporary file, fsync'd, then renamed into place — renaming is atomic on
//! the filesystems this crate targets, so a reader never observes a
//! partially-written snapshot file.

use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::configuration::Configuration;
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};

#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: Configuration,
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub metadata: SnapshotMetadata,
    pub fsm_state: Vec<u8>,
}

fn snapshot_filename(term: Term, index: LogIndex, timestamp: u64) -> String {
    format!("snapshot-{term:016x}-{index:016x}-{timestamp}")
}

impl SnapshotFile {
    fn encode(&self) -> Vec<u8> {
        let config_bytes = self.metadata.configuration.encode();
        let mut out = Vec::new();
        out.write_u64::<LE>(self.metadata.last_included_index).unwrap();
        out.write_u64::<LE>(self.metadata.last_included_term).unwrap();
        out.write_u64::<LE>(config_bytes.len() as u64).unwrap();
        out.extend_from_slice(&config_bytes);
        out.extend_from_slice(&self.fsm_state);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let last_included_index = r
            .read_u64::<LE>()
            .map_err(|_| RaftError::Corrupt("snapshot: truncated last_included_index".into()))?;
        let last_included_term = r
            .read_u64::<LE>()
            .map_err(|_| RaftError::Corrupt("snapshot: truncated last_included_term".into()))?;
        let config_len = r
            .read_u64::<LE>()
            .map_err(|_| RaftError::Corrupt("snapshot: truncated configuration length".into()))? as usize;
        if r.len() < config_len {
            return Err(RaftError::Corrupt("snapshot: truncated configuration".into()));
        }
        let configuration = Configuration::decode(&r[..config_len])?;
        let fsm_state = r[config_len..].to_vec();

        Ok(SnapshotFile {
            metadata: SnapshotMetadata { last_included_index, last_included_term, configuration },
            fsm_state,
        })
    }
}

/// Writes `snapshot` atomically into `dir` and returns the path it now
/// lives at. `timestamp` is passed in rather than read from the clock so
/// that callers (and tests) control naming deterministically.
pub async fn write_atomic(dir: &Path, snapshot: &SnapshotFile, timestamp: u64) -> Result<PathBuf> {
    let final_name = snapshot_filename(
        snapshot.metadata.last_included_term,
        snapshot.metadata.last_included_index,
        timestamp,
    );
    let final_path = dir.join(&final_name);
    let tmp_path = dir.join(format!("{final_name}.tmp"));

    let bytes = snapshot.encode();
    tokio::fs::write(&tmp_path, &bytes).await.map_err(RaftError::IoError)?;
    let file = tokio::fs::File::open(&tmp_path).await.map_err(RaftError::IoError)?;
    file.sync_all().await.map_err(RaftError::IoError)?;
    drop(file);

    tokio::fs::rename(&tmp_path, &final_path).await.map_err(RaftError::IoError)?;
    let dir_handle = tokio::fs::File::open(dir).await.map_err(RaftError::IoError)?;
    dir_handle.sync_all().await.map_err(RaftError::IoError)?;

    Ok(final_path)
}

pub async fn read(path: &Path) -> Result<SnapshotFile> {
    let bytes = tokio::fs::read(path).await.map_err(RaftError::IoError)?;
    SnapshotFile::decode(&bytes)
}

/// Finds the most recent (highest `last_included_index`) snapshot file in
/// `dir`, if any. Files still bearing the `.tmp` suffix are ignored — they
/// never completed the atomic rename and are either in flight or orphaned
/// from a crash mid-write.
pub async fn find_latest(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(LogIndex, PathBuf)> = None;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RaftError::IoError(e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(RaftError::IoError)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("snapshot-") || name.ends_with(".tmp") {
            continue;
        }
        let parts: Vec<&str> = name.splitn(4, '-').collect();
        if parts.len() < 3 {
            continue;
        }
        let Ok(index) = LogIndex::from_str_radix(parts[2], 16) else { continue };
        if best.as_ref().map(|(i, _)| index > *i).unwrap_or(true) {
            best = Some((index, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

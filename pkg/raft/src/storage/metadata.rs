//! The two-file atomic scheme for persistent hard state.
//!
//! `current-term`, `voted-for`, and `first-index` are small enough to
//! rewrite in full on every change, so rather than an append-only log for
//! them we keep two files (`metadata1`, `metadata2`) and always write the
//! *other* one before adopting it — the classic double-buffer trick for
//! atomic updates on a filesystem that only guarantees a single `fsync`'d
//! file is durable, not a rename-free overwrite.

use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, ServerId, Term};

const METADATA_MAGIC_LEN: usize = 32;
const FILE_NAMES: [&str; 2] = ["metadata1", "metadata2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistentMetadata {
    pub version: u64,
    pub current_term: Term,
    pub voted_for: ServerId,
    pub first_index: LogIndex,
}

impl PersistentMetadata {
    fn encode(&self) -> [u8; METADATA_MAGIC_LEN] {
        let mut buf = [0u8; METADATA_MAGIC_LEN];
        {
            let mut w = &mut buf[..];
            w.write_u64::<LE>(self.version).unwrap();
            w.write_u64::<LE>(self.current_term).unwrap();
            w.write_u64::<LE>(self.voted_for).unwrap();
            w.write_u64::<LE>(self.first_index).unwrap();
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_MAGIC_LEN {
            return Err(RaftError::Corrupt("metadata: truncated file".into()));
        }
        let mut r = buf;
        let version = r.read_u64::<LE>().unwrap();
        let current_term = r.read_u64::<LE>().unwrap();
        let voted_for = r.read_u64::<LE>().unwrap();
        let first_index = r.read_u64::<LE>().unwrap();
        Ok(PersistentMetadata { version, current_term, voted_for, first_index })
    }
}

/// Owns both files on disk and the in-memory value currently considered
/// durable. `write` always targets the slot not holding the current
/// version, fsyncs it, adopts it in memory, then removes the old slot.
pub struct MetadataStore {
    dir: PathBuf,
    active_slot: usize,
    current: PersistentMetadata,
}

impl MetadataStore {
    /// Loads whichever of the two files has the higher version. Absence of
    /// both means a brand-new server (`current_term = 0`, `voted_for = 0`).
    pub async fn load(dir: &Path) -> Result<MetadataStore> {
        let mut best: Option<(usize, PersistentMetadata)> = None;
        for (slot, name) in FILE_NAMES.iter().enumerate() {
            let path = dir.join(name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let parsed = PersistentMetadata::decode(&bytes)?;
                    if best.as_ref().map(|(_, b)| parsed.version > b.version).unwrap_or(true) {
                        best = Some((slot, parsed));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RaftError::IoError(e)),
            }
        }

        match best {
            Some((slot, meta)) => Ok(MetadataStore { dir: dir.to_path_buf(), active_slot: slot, current: meta }),
            None => Ok(MetadataStore {
                dir: dir.to_path_buf(),
                active_slot: 1, // so the first `write` lands on slot 0
                current: PersistentMetadata::default(),
            }),
        }
    }

    pub fn current(&self) -> PersistentMetadata {
        self.current
    }

    /// Atomically persists `next` (with `next.version` overwritten to
    /// `current.version + 1`): write the inactive slot, fsync it, adopt it
    /// in memory, then best-effort remove the now-stale slot.
    pub async fn write(&mut self, mut next: PersistentMetadata) -> Result<()> {
        next.version = self.current.version + 1;
        let target_slot = 1 - self.active_slot;
        let path = self.dir.join(FILE_NAMES[target_slot]);

        let bytes = next.encode();
        tokio::fs::write(&path, bytes).await.map_err(RaftError::IoError)?;
        let file = tokio::fs::File::open(&path).await.map_err(RaftError::IoError)?;
        file.sync_all().await.map_err(RaftError::IoError)?;

        self.active_slot = target_slot;
        self.current = next;

        let stale_path = self.dir.join(FILE_NAMES[1 - target_slot]);
        let _ = tokio::fs::remove_file(&stale_path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_directory_yields_default_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::load(dir.path()).await.unwrap();
        assert_eq!(store.current(), PersistentMetadata::default());
    }

    #[tokio::test]
    async fn write_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path()).await.unwrap();
        store
            .write(PersistentMetadata { version: 0, current_term: 4, voted_for: 2, first_index: 1 })
            .await
            .unwrap();

        let reloaded = MetadataStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.current().current_term, 4);
        assert_eq!(reloaded.current().voted_for, 2);
        assert_eq!(reloaded.current().first_index, 1);
    }

    #[tokio::test]
    async fn repeated_writes_alternate_slots_and_pick_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::load(dir.path()).await.unwrap();
        for term in 1..=5 {
            let mut next = store.current();
            next.current_term = term;
            store.write(next).await.unwrap();
        }
        assert_eq!(store.current().current_term, 5);

        let reloaded = MetadataStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.current().current_term, 5);
    }
}

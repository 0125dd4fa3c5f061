//! Segmented on-disk log storage: a pool of pre-allocated open
//! segments, a list of sealed closed segments, the two-file metadata
//! scheme, and atomic snapshot files, all tied together behind one
//! [`LogStorage`] that the consensus module drives.

pub mod frame;
pub mod metadata;
pub mod pool;
pub mod snapshot;

use std::path::PathBuf;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log_entry::{EntryType, LogEntry};
use crate::log_index::LogIndexTable;
use crate::types::{LogIndex, ServerId, Term};

use self::metadata::MetadataStore;
use self::pool::{OpenSegment, SegmentPool};

struct ClosedSegment {
    first_index: LogIndex,
    last_index: LogIndex,
    path: PathBuf,
}

struct CurrentSegment {
    segment: OpenSegment,
    first_index: LogIndex,
    last_index: LogIndex,
    bytes_written: u64,
    /// `(last_index_in_frame, bytes_written_after_frame)` for every frame
    /// written so far, so a suffix truncation landing mid-segment knows
    /// exactly how far back to rewind and zero.
    frame_boundaries: Vec<(LogIndex, u64)>,
}

pub struct LogStorage {
    dir: PathBuf,
    config: RaftConfig,
    pub index: LogIndexTable,
    pool: SegmentPool,
    closed: Vec<ClosedSegment>,
    current: Option<CurrentSegment>,
    metadata: MetadataStore,
}

impl LogStorage {
    /// Scans `dir`, validates every closed segment by CRC and index
    /// continuity, seals or discards any orphan open segment left over from
    /// a crash, and loads the two-file metadata scheme.
    pub async fn load(dir: PathBuf, config: RaftConfig) -> Result<LogStorage> {
        tokio::fs::create_dir_all(&dir).await.map_err(RaftError::IoError)?;
        let metadata = MetadataStore::load(&dir).await?;
        let persisted = metadata.current();

        let mut closed_names: Vec<(LogIndex, LogIndex, String)> = Vec::new();
        let mut open_names: Vec<(u64, String)> = Vec::new();
        let mut max_open_counter: u64 = 0;

        let mut entries_iter = tokio::fs::read_dir(&dir).await.map_err(RaftError::IoError)?;
        while let Some(entry) = entries_iter.next_entry().await.map_err(RaftError::IoError)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix("open-") {
                if let Ok(counter) = rest.parse::<u64>() {
                    max_open_counter = max_open_counter.max(counter + 1);
                    open_names.push((counter, name));
                }
            } else if let Some((first_hex, last_hex)) = name.split_once('-') {
                if first_hex.len() == 16 && last_hex.len() == 16 {
                    if let (Ok(first), Ok(last)) =
                        (LogIndex::from_str_radix(first_hex, 16), LogIndex::from_str_radix(last_hex, 16))
                    {
                        closed_names.push((first, last, name));
                    }
                }
            }
        }
        closed_names.sort_by_key(|(first, _, _)| *first);
        open_names.sort_by_key(|(counter, _)| *counter);

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut expected_index = persisted.first_index.max(1);
        let mut closed_segments = Vec::new();

        for (first, last, name) in &closed_names {
            let path = dir.join(name);
            let bytes = tokio::fs::read(&path).await.map_err(RaftError::IoError)?;
            if *first != expected_index {
                return Err(RaftError::Corrupt(format!(
                    "segment {name}: gap in log (expected first_index {expected_index}, segment starts at {first})"
                )));
            }
            let mut offset = 0usize;
            let mut idx = *first;
            while offset < bytes.len() {
                let decoded = frame::decode_frame(&bytes[offset..])?;
                for d in decoded.entries {
                    entries.push(LogEntry::new(idx, d.term, d.entry_type, d.payload));
                    idx += 1;
                }
                offset += decoded.frame_len;
            }
            if idx != last + 1 {
                return Err(RaftError::Corrupt(format!(
                    "segment {name}: expected to end at index {last}, decoded up to {}",
                    idx.saturating_sub(1)
                )));
            }
            expected_index = idx;
            closed_segments.push(ClosedSegment { first_index: *first, last_index: *last, path });
        }

        for (_, name) in open_names {
            let path = dir.join(&name);
            let bytes = tokio::fs::read(&path).await.map_err(RaftError::IoError)?;
            let mut offset = 0usize;
            let mut idx = expected_index;
            let mut recovered = Vec::new();
            while offset < bytes.len() {
                match frame::decode_frame(&bytes[offset..]) {
                    Ok(decoded) => {
                        for d in decoded.entries {
                            recovered.push(LogEntry::new(idx, d.term, d.entry_type, d.payload));
                            idx += 1;
                        }
                        offset += decoded.frame_len;
                    }
                    Err(_) => break,
                }
            }
            if recovered.is_empty() {
                let _ = tokio::fs::remove_file(&path).await;
            } else {
                let first = expected_index;
                let last = idx - 1;
                let sealed_name = format!("{first:016x}-{last:016x}");
                let sealed_path = dir.join(&sealed_name);
                tokio::fs::rename(&path, &sealed_path).await.map_err(RaftError::IoError)?;
                entries.extend(recovered);
                closed_segments.push(ClosedSegment { first_index: first, last_index: last, path: sealed_path });
                expected_index = idx;
            }
        }

        let table_first_index = entries.first().map(|e| e.index).unwrap_or(persisted.first_index);
        let pool = SegmentPool::new(
            dir.clone(),
            max_open_counter,
            config.segment_target_pool_size,
            config.segment_size_bytes(),
        );

        Ok(LogStorage {
            dir,
            config,
            index: LogIndexTable::from_entries(table_first_index, entries),
            pool,
            closed: closed_segments,
            current: None,
            metadata,
        })
    }

    pub fn current_term(&self) -> Term {
        self.metadata.current().current_term
    }

    pub fn voted_for(&self) -> ServerId {
        self.metadata.current().voted_for
    }

    pub fn storage_error(&self) -> Option<&str> {
        self.pool.last_error()
    }

    pub fn pool_is_preparing(&self) -> bool {
        self.pool.is_preparing()
    }

    pub async fn pool_drive(&mut self) {
        self.pool.drive().await
    }

    pub async fn persist_term_and_vote(&mut self, current_term: Term, voted_for: ServerId) -> Result<()> {
        let mut next = self.metadata.current();
        next.current_term = current_term;
        next.voted_for = voted_for;
        self.metadata.write(next).await
    }

    /// Appends a batch of entries as a single frame, returning the index of
    /// the last entry appended (or the log's current last index if `batch`
    /// is empty).
    pub async fn append_batch(&mut self, batch: Vec<(Term, EntryType, Vec<u8>)>) -> Result<LogIndex> {
        if batch.is_empty() {
            return Ok(self.index.last_index());
        }
        if let Some(err) = self.pool.last_error() {
            return Err(RaftError::IoError(std::io::Error::other(err.to_string())));
        }

        let start_index = self.index.last_index() + 1;
        let encode_input: Vec<(Term, EntryType, &[u8])> =
            batch.iter().map(|(t, ty, p)| (*t, *ty, p.as_slice())).collect();
        let frame_bytes = frame::encode_frame(&encode_input);
        let last_index = start_index + batch.len() as LogIndex - 1;

        self.ensure_current_segment(start_index).await?;
        self.write_frame_to_current(&frame_bytes, last_index).await?;

        let mut idx = start_index;
        for (term, entry_type, payload) in batch {
            self.index.append(LogEntry::new(idx, term, entry_type, payload));
            idx += 1;
        }

        self.maybe_rotate().await?;
        Ok(last_index)
    }

    async fn ensure_current_segment(&mut self, first_index: LogIndex) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = oneshot::channel();
        self.pool.request(tx);
        let segment = loop {
            match rx.try_recv() {
                Ok(Ok(seg)) => break seg,
                Ok(Err(e)) => return Err(e),
                Err(TryRecvError::Empty) => self.pool.drive().await,
                Err(TryRecvError::Closed) => return Err(RaftError::Canceled),
            }
        };
        self.current = Some(CurrentSegment {
            segment,
            first_index,
            last_index: first_index.saturating_sub(1),
            bytes_written: 0,
            frame_boundaries: Vec::new(),
        });
        Ok(())
    }

    async fn write_frame_to_current(&mut self, bytes: &[u8], last_index: LogIndex) -> Result<()> {
        let cur = self.current.as_mut().expect("current segment must be acquired first");
        cur.segment
            .file
            .seek(std::io::SeekFrom::Start(cur.bytes_written))
            .await
            .map_err(RaftError::IoError)?;
        cur.segment.file.write_all(bytes).await.map_err(RaftError::IoError)?;
        cur.segment.file.sync_all().await.map_err(RaftError::IoError)?;
        cur.bytes_written += bytes.len() as u64;
        cur.last_index = last_index;
        cur.frame_boundaries.push((last_index, cur.bytes_written));
        Ok(())
    }

    async fn maybe_rotate(&mut self) -> Result<()> {
        let should_rotate = match &self.current {
            Some(cur) => cur.bytes_written >= self.config.segment_size_bytes(),
            None => false,
        };
        if !should_rotate {
            return Ok(());
        }
        let cur = self.current.take().unwrap();
        let sealed_name = format!("{:016x}-{:016x}", cur.first_index, cur.last_index);
        let sealed_path = self.dir.join(&sealed_name);
        tokio::fs::rename(&cur.segment.path, &sealed_path).await.map_err(RaftError::IoError)?;
        self.closed.push(ClosedSegment { first_index: cur.first_index, last_index: cur.last_index, path: sealed_path });
        // Eagerly consume a replacement so the next append never stalls on
        // a cold preparation ("a new open segment is consumed from
        // the pool, and a replacement preparation is started").
        self.ensure_current_segment(cur.last_index + 1).await?;
        Ok(())
    }

    /// Drops every entry with `index >= from_index` (follower conflict
    /// resolution). On disk, a sealed segment that falls entirely at or
    /// after `from_index` is deleted outright; one that spans the cut has
    /// its surviving prefix (`first_index..from_index`) re-encoded into a
    /// fresh `<first>-<from_index-1>` segment via the same
    /// write-tmp-then-rename idiom `snapshot::write_atomic` uses, and the
    /// old file is removed only once that rename lands — so a crash
    /// mid-salvage leaves the original segment intact rather than losing
    /// the prefix. Entries still held only in memory are released by
    /// [`LogIndexTable::truncate_suffix`] afterwards, since salvaging reads
    /// the surviving payloads back out of the index before truncating it.
    pub async fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<()> {
        let mut keep = Vec::new();
        let mut to_delete = Vec::new();
        let mut to_salvage = Vec::new();
        for seg in self.closed.drain(..) {
            if seg.last_index < from_index {
                keep.push(seg);
            } else if seg.first_index >= from_index {
                to_delete.push(seg);
            } else {
                to_salvage.push(seg);
            }
        }

        for seg in to_salvage {
            let survivors: Vec<(Term, EntryType, Vec<u8>)> = (seg.first_index..from_index)
                .map(|idx| {
                    let entry = self
                        .index
                        .get(idx)
                        .expect("entry below from_index must still be indexed before truncation");
                    (entry.term, entry.entry_type, entry.payload.to_vec())
                })
                .collect();
            let encode_input: Vec<(Term, EntryType, &[u8])> =
                survivors.iter().map(|(t, ty, p)| (*t, *ty, p.as_slice())).collect();
            let frame_bytes = frame::encode_frame(&encode_input);

            let new_last = from_index - 1;
            let sealed_name = format!("{:016x}-{:016x}", seg.first_index, new_last);
            let sealed_path = self.dir.join(&sealed_name);
            let tmp_path = self.dir.join(format!("{sealed_name}.tmp"));
            tokio::fs::write(&tmp_path, &frame_bytes).await.map_err(RaftError::IoError)?;
            let tmp_file = tokio::fs::File::open(&tmp_path).await.map_err(RaftError::IoError)?;
            tmp_file.sync_all().await.map_err(RaftError::IoError)?;
            drop(tmp_file);
            tokio::fs::rename(&tmp_path, &sealed_path).await.map_err(RaftError::IoError)?;
            let dir_handle = tokio::fs::File::open(&self.dir).await.map_err(RaftError::IoError)?;
            dir_handle.sync_all().await.map_err(RaftError::IoError)?;

            let _ = tokio::fs::remove_file(&seg.path).await;
            keep.push(ClosedSegment { first_index: seg.first_index, last_index: new_last, path: sealed_path });
        }
        self.closed = keep;

        self.index.truncate_suffix(from_index);

        for seg in to_delete {
            let _ = tokio::fs::remove_file(&seg.path).await;
        }

        if let Some(cur) = &mut self.current {
            if cur.first_index >= from_index {
                let seg = self.current.take().unwrap();
                let _ = tokio::fs::remove_file(&seg.segment.path).await;
            } else if cur.last_index >= from_index {
                let keep_bytes = cur
                    .frame_boundaries
                    .iter()
                    .rev()
                    .find(|(last, _)| *last < from_index)
                    .map(|(_, bytes)| *bytes)
                    .unwrap_or(0);
                let stale_len = cur.bytes_written - keep_bytes;
                if stale_len > 0 {
                    cur.segment
                        .file
                        .seek(std::io::SeekFrom::Start(keep_bytes))
                        .await
                        .map_err(RaftError::IoError)?;
                    cur.segment
                        .file
                        .write_all(&vec![0u8; stale_len as usize])
                        .await
                        .map_err(RaftError::IoError)?;
                    cur.segment.file.sync_all().await.map_err(RaftError::IoError)?;
                }
                cur.bytes_written = keep_bytes;
                cur.frame_boundaries.retain(|(last, _)| *last < from_index);
                cur.last_index = from_index - 1;
            }
        }
        Ok(())
    }

    /// Drops every entry with `index <= up_to_index` (post-snapshot
    /// compaction) and persists the new `first_index`.
    pub async fn truncate_prefix(&mut self, up_to_index: LogIndex) -> Result<()> {
        self.index.truncate_prefix(up_to_index);

        let mut keep = Vec::new();
        for seg in self.closed.drain(..) {
            if seg.last_index <= up_to_index {
                let _ = tokio::fs::remove_file(&seg.path).await;
            } else {
                keep.push(seg);
            }
        }
        self.closed = keep;

        let mut next = self.metadata.current();
        next.first_index = self.index.first_index().max(up_to_index + 1);
        self.metadata.write(next).await
    }

    /// Applies a received `InstallSnapshot`: discards the log wholesale if
    /// the snapshot supersedes everything held locally, otherwise just
    /// compacts the covered prefix.
    pub async fn install_snapshot(&mut self, last_included_index: LogIndex) -> Result<()> {
        if last_included_index >= self.index.last_index() {
            for seg in self.closed.drain(..) {
                let _ = tokio::fs::remove_file(&seg.path).await;
            }
            if let Some(cur) = self.current.take() {
                let _ = tokio::fs::remove_file(&cur.segment.path).await;
            }
            self.index = LogIndexTable::from_entries(last_included_index + 1, Vec::new());
            let mut next = self.metadata.current();
            next.first_index = last_included_index + 1;
            self.metadata.write(next).await
        } else {
            self.truncate_prefix(last_included_index).await
        }
    }

    pub async fn close(&mut self) {
        self.pool.close().await;
    }
}

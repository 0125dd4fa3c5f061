//! The open-segment pool and its preparation protocol.
//!
//! A target of `N` pre-allocated, zero-filled `open-<counter>` files is kept
//! ready so the writer never has to wait on `allocate` + directory-`fsync`
//! on the hot append path. At most one preparation runs at a time
//! (`preparing` is a singleton slot, mirroring the "prepare-inflight" slot
//! in the design); its completion is driven by [`SegmentPool::drive`],
//! which the owning event loop polls alongside its other `select!` arms —
//! the same "long work on a worker thread, completion re-entered on the
//! main loop" split the whole crate uses for FSM applies and snapshot
//! writes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{RaftError, Result};

/// A pre-allocated segment file, ready to receive writes.
pub struct OpenSegment {
    pub counter: u64,
    pub path: PathBuf,
    pub file: tokio::fs::File,
}

struct RawSegment {
    counter: u64,
    path: PathBuf,
    file: std::fs::File,
}

fn prepare_segment_blocking(dir: &Path, counter: u64, segment_bytes: u64) -> std::io::Result<RawSegment> {
    let path = dir.join(format!("open-{counter}"));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.set_len(segment_bytes)?;
    file.sync_all()?;
    // Directory fsync so the new file's directory entry survives a crash
    // even before any of its data blocks are touched again.
    let dir_handle = std::fs::File::open(dir)?;
    dir_handle.sync_all()?;
    Ok(RawSegment { counter, path, file })
}

pub struct SegmentPool {
    dir: PathBuf,
    target: usize,
    segment_bytes: u64,
    next_counter: u64,
    ready: VecDeque<OpenSegment>,
    pending: VecDeque<oneshot::Sender<Result<OpenSegment>>>,
    preparing: Option<JoinHandle<std::io::Result<RawSegment>>>,
    errored: Option<String>,
    closing: bool,
}

impl SegmentPool {
    pub fn new(dir: PathBuf, next_counter: u64, target: usize, segment_bytes: u64) -> Self {
        SegmentPool {
            dir,
            target: target.max(1),
            segment_bytes,
            next_counter,
            ready: VecDeque::new(),
            pending: VecDeque::new(),
            preparing: None,
            errored: None,
            closing: false,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errored.as_deref()
    }

    pub fn is_preparing(&self) -> bool {
        self.preparing.is_some()
    }

    /// Hands back a ready segment if one exists; otherwise enqueues `tx` and
    /// (if needed) kicks off a new preparation. The caller is expected to
    /// pair this with awaiting the matching `oneshot::Receiver`.
    pub fn request(&mut self, tx: oneshot::Sender<Result<OpenSegment>>) {
        if let Some(err) = &self.errored {
            let _ = tx.send(Err(RaftError::IoError(std::io::Error::other(err.clone()))));
            return;
        }
        if let Some(seg) = self.ready.pop_front() {
            let _ = tx.send(Ok(seg));
            self.maybe_start_preparation();
            return;
        }
        self.pending.push_back(tx);
        self.maybe_start_preparation();
    }

    fn maybe_start_preparation(&mut self) {
        if self.preparing.is_some() || self.closing || self.errored.is_some() {
            return;
        }
        if self.pending.is_empty() && self.ready.len() >= self.target {
            return;
        }
        let counter = self.next_counter;
        self.next_counter += 1;
        let dir = self.dir.clone();
        let segment_bytes = self.segment_bytes;
        self.preparing = Some(tokio::task::spawn_blocking(move || prepare_segment_blocking(&dir, counter, segment_bytes)));
    }

    /// Awaits the in-flight preparation, if any, and routes its result to
    /// the oldest pending request or into the ready pool. Intended to be
    /// one arm of the owning event loop's `select!`, guarded by
    /// `is_preparing()`.
    pub async fn drive(&mut self) {
        let handle = match self.preparing.take() {
            Some(h) => h,
            None => return,
        };

        match handle.await {
            Ok(Ok(raw)) => {
                if self.closing {
                    let _ = tokio::fs::remove_file(&raw.path).await;
                    return;
                }
                let segment = OpenSegment {
                    counter: raw.counter,
                    path: raw.path,
                    file: tokio::fs::File::from_std(raw.file),
                };
                if let Some(tx) = self.pending.pop_front() {
                    let _ = tx.send(Ok(segment));
                } else {
                    self.ready.push_back(segment);
                }
                self.maybe_start_preparation();
            }
            Ok(Err(io_err)) => self.fail_all(io_err.to_string()),
            Err(join_err) => self.fail_all(join_err.to_string()),
        }
    }

    /// Fails every currently pending request and marks the pool permanently
    /// errored; a prior error message (if any) is never overwritten, and no
    /// further preparation is attempted afterwards.
    fn fail_all(&mut self, message: String) {
        if self.errored.is_none() {
            self.errored = Some(message.clone());
        }
        while let Some(tx) = self.pending.pop_front() {
            let _ = tx.send(Err(RaftError::IoError(std::io::Error::other(message.clone()))));
        }
    }

    /// Cancels all pending requests, closes and removes every ready
    /// segment, and awaits (then discards) any in-flight preparation.
    /// Resolves only once the in-flight preparation (if any) has settled.
    pub async fn close(&mut self) {
        self.closing = true;
        while let Some(tx) = self.pending.pop_front() {
            let _ = tx.send(Err(RaftError::Canceled));
        }
        while let Some(seg) = self.ready.pop_front() {
            drop(seg.file);
            let _ = tokio::fs::remove_file(&seg.path).await;
        }
        if let Some(handle) = self.preparing.take() {
            if let Ok(Ok(raw)) = handle.await {
                drop(raw.file);
                let _ = tokio::fs::remove_file(&raw.path).await;
            }
        }
    }

    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn acquire(pool: &mut SegmentPool) -> Result<OpenSegment> {
        let (tx, rx) = oneshot::channel();
        pool.request(tx);
        while pool.is_preparing() {
            pool.drive().await;
        }
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn acquire_prepares_and_returns_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SegmentPool::new(dir.path().to_path_buf(), 0, 2, 4096);
        let seg = acquire(&mut pool).await.unwrap();
        assert_eq!(seg.counter, 0);
        assert!(seg.path.exists());
    }

    #[tokio::test]
    async fn close_removes_ready_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SegmentPool::new(dir.path().to_path_buf(), 0, 1, 4096);
        let seg = acquire(&mut pool).await.unwrap();
        drop(seg); // file stays open but unreferenced; pool doesn't track it once handed out
        // Top the pool back up so `close` has something ready to clean.
        let (tx, _rx) = oneshot::channel();
        pool.request(tx);
        while pool.is_preparing() {
            pool.drive().await;
        }
        pool.close().await;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn allocation_failure_marks_pool_errored_and_fails_pending() {
        let dir = tempfile::tempdir().unwrap();
        // Use a directory that doesn't exist to force the blocking prepare to fail.
        let bogus = dir.path().join("does-not-exist");
        let mut pool = SegmentPool::new(bogus, 0, 1, 4096);
        let (tx, rx) = oneshot::channel();
        pool.request(tx);
        while pool.is_preparing() {
            pool.drive().await;
        }
        assert!(rx.await.unwrap().is_err());
        assert!(pool.last_error().is_some());

        // A further request is failed immediately without starting another preparation.
        let (tx2, rx2) = oneshot::channel();
        pool.request(tx2);
        assert!(!pool.is_preparing());
        assert!(rx2.await.unwrap().is_err());
    }
}

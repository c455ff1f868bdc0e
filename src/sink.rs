use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Append-only buffered writer in front of the partial cache file.
///
/// Chunks are accepted synchronously into an in-memory builder and drained
/// to disk by [`flush`](BufferedSink::flush). Concurrent flush calls
/// coalesce: a gate serializes the drain, so every caller returns once the
/// bytes present at its call time are durable. `flushed_bytes` is the
/// durable position relative to the sink's start offset.
#[derive(Debug)]
pub struct BufferedSink {
    file: Mutex<Option<File>>,
    buffer: StdMutex<Vec<u8>>,
    buffered: AtomicUsize,
    flushed: AtomicU64,
    flush_gate: Mutex<()>,
    closed: AtomicBool,
}

impl BufferedSink {
    /// Open the partial file for writing. A sink starting at offset zero
    /// truncates; a resuming sink appends and requires the file length to
    /// equal the start offset.
    pub async fn open(path: &Path, start: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::write(&e))?;
        }

        let file = if start == 0 {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await
                .map_err(|e| CacheError::write(&e))?
        } else {
            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|e| CacheError::write(&e))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| CacheError::write(&e))?
                .len();
            if len != start {
                return Err(CacheError::Write(format!(
                    "partial file is {} bytes, expected {} to resume",
                    len, start
                )));
            }
            file
        };

        debug!("opened sink at {:?} (start {})", path, start);

        Ok(Self {
            file: Mutex::new(Some(file)),
            buffer: StdMutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            flushed: AtomicU64::new(0),
            flush_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Append a chunk to the in-memory builder. Never blocks on I/O.
    pub fn add(&self, chunk: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Write("sink is closed".into()));
        }
        let mut buffer = self.buffer.lock().expect("sink buffer poisoned");
        buffer.extend_from_slice(chunk);
        self.buffered.fetch_add(chunk.len(), Ordering::Release);
        Ok(())
    }

    /// Bytes accepted but not yet durable.
    pub fn buffer_size(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Durable bytes, relative to the sink's start offset.
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    /// Whether a flush is currently draining the builder.
    pub fn is_flushing(&self) -> bool {
        self.flush_gate.try_lock().is_err()
    }

    /// Drain the builder to disk. While the builder is non-empty, its
    /// contents are taken and appended; concurrent callers wait on the same
    /// drain. Write failures are propagated, never retried here.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        loop {
            let chunk = {
                let mut buffer = self.buffer.lock().expect("sink buffer poisoned");
                if buffer.is_empty() {
                    break;
                }
                std::mem::take(&mut *buffer)
            };

            let mut file = self.file.lock().await;
            let file = file
                .as_mut()
                .ok_or_else(|| CacheError::Write("sink is closed".into()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CacheError::write(&e))?;
            file.flush().await.map_err(|e| CacheError::write(&e))?;

            self.flushed.fetch_add(chunk.len() as u64, Ordering::Release);
            self.buffered.fetch_sub(chunk.len(), Ordering::Release);
        }
        Ok(())
    }

    /// Flush (optionally) and close the underlying file. Idempotent.
    pub async fn close(&self, flush_buffer: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if flush_buffer {
            self.flush().await?;
        }
        if let Some(mut file) = self.file.lock().await.take() {
            file.shutdown().await.map_err(|e| CacheError::write(&e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn appends_and_tracks_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");

        let sink = BufferedSink::open(&path, 0).await.unwrap();
        sink.add(b"hello ").unwrap();
        sink.add(b"world").unwrap();
        assert_eq!(sink.buffer_size(), 11);
        assert_eq!(sink.flushed_bytes(), 0);

        sink.flush().await.unwrap();
        assert_eq!(sink.buffer_size(), 0);
        assert_eq!(sink.flushed_bytes(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn resume_appends_at_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");
        std::fs::write(&path, b"prefix").unwrap();

        let sink = BufferedSink::open(&path, 6).await.unwrap();
        sink.add(b"-tail").unwrap();
        sink.close(true).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"prefix-tail");
        assert_eq!(sink.flushed_bytes(), 5);
    }

    #[tokio::test]
    async fn resume_rejects_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");
        std::fs::write(&path, b"four").unwrap();

        assert!(matches!(
            BufferedSink::open(&path, 10).await,
            Err(CacheError::Write(_))
        ));
    }

    #[tokio::test]
    async fn truncates_when_starting_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");
        std::fs::write(&path, b"stale data").unwrap();

        let sink = BufferedSink::open(&path, 0).await.unwrap();
        sink.add(b"new").unwrap();
        sink.close(true).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn concurrent_flushes_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");
        let sink = Arc::new(BufferedSink::open(&path, 0).await.unwrap());

        sink.add(&vec![7u8; 256 * 1024]).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move { sink.flush().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(sink.flushed_bytes(), 256 * 1024);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 256 * 1024);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_adds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4.part");
        let sink = BufferedSink::open(&path, 0).await.unwrap();

        sink.add(b"data").unwrap();
        sink.close(true).await.unwrap();
        sink.close(true).await.unwrap();
        assert!(sink.add(b"more").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }
}

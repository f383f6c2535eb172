// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Seekable reads over range GETs
//!
//! One contiguous window `[buffer_start, buffer_start + buffer.len())` is
//! kept per stream. Reads inside it are served locally; anything else issues
//! a range request for the missing bytes plus `readahead` and replaces the
//! window. The object is assumed not to change while a stream is open.

use crate::client::ByteRange;
use crate::error::{FsError, Result};
use crate::fs::Shared;
use crate::path::ObjectPath;
use bytes::{Bytes, BytesMut};
use diagnostics::*;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Prefetch {
    start: u64,
    handle: JoinHandle<Result<Bytes>>,
}

pub struct ReadStream {
    path: ObjectPath,
    shared: Arc<Shared>,
    position: u64,
    size: Option<u64>,
    buffer: Bytes,
    buffer_start: u64,
    prefetch: Option<Prefetch>,
    cancel: CancellationToken,
    closed: bool,
}

impl ReadStream {
    pub(crate) fn new(path: ObjectPath, shared: Arc<Shared>, size: Option<u64>) -> Self {
        Self {
            path: path.as_file(),
            shared,
            position: 0,
            size,
            buffer: Bytes::new(),
            buffer_start: 0,
            prefetch: None,
            cancel: CancellationToken::new(),
            closed: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    #[must_use]
    pub fn tell(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::closed_stream(&self.path));
        }
        Ok(())
    }

    fn buffer_end(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    /// Object size, looked up once per stream through the metadata cache
    pub async fn size(&mut self) -> Result<u64> {
        self.check_open()?;
        if let Some(size) = self.size {
            return Ok(size);
        }
        let shared = Arc::clone(&self.shared);
        let info = shared
            .cache
            .get_or_fetch(&self.path, || shared.head(&self.path))
            .await?;
        if info.is_directory {
            return Err(FsError::not_found(&self.path));
        }
        self.size = Some(info.size);
        Ok(info.size)
    }

    /// Read up to `n` bytes from the current position. Returns fewer bytes
    /// near the end of the object and none at or past it.
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        self.check_open()?;
        let size = self.size().await?;
        if n == 0 || self.position >= size {
            return Ok(Bytes::new());
        }
        let start = self.position;
        let end = size.min(start.saturating_add(n as u64));

        let out = if start >= self.buffer_start && end <= self.buffer_end() {
            self.slice(start, end)
        } else if start >= self.buffer_start && start < self.buffer_end() {
            // keep the buffered head, fetch the rest as the next window
            let head = self.slice(start, self.buffer_end());
            let from = self.buffer_end();
            self.fill(from, end, size).await?;
            let mut joined = BytesMut::with_capacity((end - start) as usize);
            joined.extend_from_slice(&head);
            joined.extend_from_slice(&self.slice(from, end));
            joined.freeze()
        } else {
            self.fill(start, end, size).await?;
            self.slice(start, end)
        };

        self.position = end;
        self.maybe_prefetch(size);
        Ok(out)
    }

    /// Read everything from the current position to the end
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let size = self.size().await?;
        let remaining = size.saturating_sub(self.position);
        self.read(usize::try_from(remaining).unwrap_or(usize::MAX))
            .await
    }

    /// Move the read position. Offsets past the end clamp to the object
    /// size; a negative result is an error.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let size = self.size().await?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
        };
        if target < 0 {
            return Err(FsError::InvalidSeek {
                path: self.path.to_string(),
                offset: i64::try_from(target).unwrap_or(i64::MIN),
            });
        }
        self.position = u64::try_from(target).unwrap_or(u64::MAX).min(size);
        Ok(self.position)
    }

    /// Release the buffer and cancel background fetches. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(prefetch) = self.prefetch.take() {
            prefetch.handle.abort();
        }
        self.buffer = Bytes::new();
        debug!("closed read stream {path}", path: self.path.to_string());
        Ok(())
    }

    fn slice(&self, start: u64, end: u64) -> Bytes {
        let from = (start - self.buffer_start) as usize;
        let to = (end - self.buffer_start) as usize;
        self.buffer.slice(from..to)
    }

    /// Replace the window with one covering at least `[start, end)`
    async fn fill(&mut self, start: u64, end: u64, size: u64) -> Result<()> {
        if let Some(bytes) = self.take_prefetch(start, end).await {
            self.buffer_start = start;
            self.buffer = bytes;
            return Ok(());
        }

        let readahead = self.shared.config.readahead as u64;
        let range = ByteRange::new(start, size.min(end.saturating_add(readahead)));
        self.buffer = fetch_range(&self.shared, &self.path, range).await?;
        self.buffer_start = start;
        if (self.buffer.len() as u64) < end - start {
            // object shrank under us
            return Err(FsError::conflict(
                &self.path,
                format!("short read: wanted {} bytes at {start}", end - start),
            ));
        }
        Ok(())
    }

    /// Use the background fetch if it starts exactly at `start` and covers
    /// `end`; otherwise discard it.
    async fn take_prefetch(&mut self, start: u64, end: u64) -> Option<Bytes> {
        let prefetch = self.prefetch.take()?;
        if prefetch.start != start {
            prefetch.handle.abort();
            return None;
        }
        match prefetch.handle.await {
            Ok(Ok(bytes)) if start + bytes.len() as u64 >= end => Some(bytes),
            Ok(Err(err)) => {
                debug!("prefetch of {path} failed: {reason}", path: self.path.to_string(), reason: err.to_string());
                None
            }
            _ => None,
        }
    }

    /// Once the reader is past the middle of the window, start fetching the
    /// next one in the background.
    fn maybe_prefetch(&mut self, size: u64) {
        let readahead = self.shared.config.readahead as u64;
        if !self.shared.config.prefetch || readahead == 0 || self.prefetch.is_some() {
            return;
        }
        let next = self.buffer_end();
        let midpoint = self.buffer_start + self.buffer.len() as u64 / 2;
        if next >= size || self.position < midpoint {
            return;
        }

        let range = ByteRange::new(next, size.min(next + readahead));
        let shared = Arc::clone(&self.shared);
        let path = self.path.clone();
        let cancel = self.cancel.child_token();
        let handle = self.shared.pool.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(FsError::closed_stream(&path)),
                bytes = fetch_range(&shared, &path, range) => bytes,
            }
        });
        self.prefetch = Some(Prefetch {
            start: next,
            handle,
        });
    }
}

async fn fetch_range(shared: &Shared, path: &ObjectPath, range: ByteRange) -> Result<Bytes> {
    debug!(
        "range get {path} {range}",
        path: path.to_string(),
        range: range.to_header()
    );
    shared
        .retry
        .call("get", path, || {
            shared.client.get(path.bucket(), path.key(), Some(range))
        })
        .await
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(prefetch) = self.prefetch.take() {
            prefetch.handle.abort();
        }
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("window", &(self.buffer_start..self.buffer_end()))
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ObjectStoreClient;
    use crate::config::FsConfig;
    use crate::memory::{MemoryStore, Op};

    fn data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn stream(store: &Arc<MemoryStore>, config: FsConfig) -> ReadStream {
        let client: Arc<dyn ObjectStoreClient> = Arc::clone(store) as Arc<dyn ObjectStoreClient>;
        let shared = Arc::new(Shared::new(client, config));
        ReadStream::new(ObjectPath::from_parts("b", "obj"), shared, None)
    }

    fn store_with(len: usize) -> Arc<MemoryStore> {
        let store = MemoryStore::new().with_bucket("b");
        store.insert_object("b", "obj", data(len));
        Arc::new(store)
    }

    fn config(readahead: usize) -> FsConfig {
        FsConfig {
            readahead,
            ..FsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_and_partial_reads() {
        let store = store_with(100);
        let expected = data(100);
        let mut s = stream(&store, config(0));

        assert_eq!(s.seek(SeekFrom::Start(0)).await.unwrap(), 0);
        assert_eq!(s.read(100).await.unwrap(), expected);

        s.seek(SeekFrom::Start(50)).await.unwrap();
        assert_eq!(s.read(10).await.unwrap(), expected.slice(50..60));
        assert_eq!(s.tell(), 60);
    }

    #[tokio::test]
    async fn test_byte_by_byte_matches_whole() {
        let store = store_with(100);
        let expected = data(100);
        let mut s = stream(&store, config(16));

        let mut forward = Vec::new();
        loop {
            let b = s.read(1).await.unwrap();
            if b.is_empty() {
                break;
            }
            forward.extend_from_slice(&b);
        }
        assert_eq!(forward, expected.to_vec());

        // backwards, ten bytes at a time
        let mut chunks = Vec::new();
        for start in (0..100u32).step_by(10).rev() {
            s.seek(SeekFrom::Start(u64::from(start))).await.unwrap();
            chunks.push(s.read(10).await.unwrap());
        }
        chunks.reverse();
        assert_eq!(chunks.concat(), expected.to_vec());
    }

    #[tokio::test]
    async fn test_reads_inside_window_are_local() {
        let store = store_with(1000);
        let mut s = stream(&store, config(100));

        s.read(10).await.unwrap();
        assert_eq!(store.calls(Op::Get), 1);
        // [0, 110) is buffered
        s.read(50).await.unwrap();
        s.seek(SeekFrom::Start(5)).await.unwrap();
        s.read(100).await.unwrap();
        assert_eq!(store.calls(Op::Get), 1);
        assert_eq!(store.calls(Op::Head), 1);

        // straddles the window end: only the tail is fetched
        let bytes = s.read(20).await.unwrap();
        assert_eq!(bytes, data(1000).slice(105..125));
        assert_eq!(store.calls(Op::Get), 2);
    }

    #[tokio::test]
    async fn test_seek_clamps_and_rejects_negative() {
        let store = store_with(100);
        let mut s = stream(&store, config(0));

        assert_eq!(s.seek(SeekFrom::Start(500)).await.unwrap(), 100);
        assert!(s.read(10).await.unwrap().is_empty());
        assert_eq!(s.seek(SeekFrom::End(-10)).await.unwrap(), 90);
        assert_eq!(s.seek(SeekFrom::Current(5)).await.unwrap(), 95);
        assert_eq!(s.read(10).await.unwrap().len(), 5);

        let err = s.seek(SeekFrom::Current(-200)).await.unwrap_err();
        assert!(matches!(err, FsError::InvalidSeek { offset: -100, .. }));
        assert_eq!(s.tell(), 100);
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let store = store_with(10);
        let mut s = stream(&store, config(0));
        s.close().unwrap();
        s.close().unwrap();
        assert!(matches!(s.read(1).await, Err(FsError::ClosedStream(_))));
        assert!(matches!(s.seek(SeekFrom::Start(0)).await, Err(FsError::ClosedStream(_))));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        let mut s = stream(&store, config(0));
        assert!(s.read(1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_prefetch_serves_next_window() {
        let store = store_with(300);
        let expected = data(300);
        let mut s = stream(
            &store,
            FsConfig {
                readahead: 100,
                prefetch: true,
                ..FsConfig::default()
            },
        );

        let mut out = Vec::new();
        for _ in 0..30 {
            out.extend_from_slice(&s.read(10).await.unwrap());
        }
        assert_eq!(out, expected.to_vec());
        assert!(s.read(10).await.unwrap().is_empty());
        // every window was fetched exactly once
        assert_eq!(store.calls(Op::Get), 3);
        s.close().unwrap();
    }
}

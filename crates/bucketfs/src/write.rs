// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Buffered writes
//!
//! Bytes accumulate until a full part is buffered, at which point the part is
//! handed to a [`MultipartUpload`]. A stream closed before its first part
//! fills is written with a single PUT instead.

use crate::client::PutMode;
use crate::error::{FsError, Result};
use crate::fs::Shared;
use crate::metadata::written_since;
use crate::multipart::MultipartUpload;
use crate::path::ObjectPath;
use crate::retry::Verdict;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use diagnostics::*;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Aborted,
    Failed,
}

pub struct WriteStream {
    path: ObjectPath,
    shared: Arc<Shared>,
    mode: PutMode,
    buffer: BytesMut,
    upload: Option<MultipartUpload>,
    written: u64,
    etag: Option<String>,
    state: State,
}

impl WriteStream {
    pub(crate) fn new(path: ObjectPath, shared: Arc<Shared>, mode: PutMode) -> Self {
        Self {
            path: path.as_file(),
            shared,
            mode,
            buffer: BytesMut::new(),
            upload: None,
            written: 0,
            etag: None,
            state: State::Open,
        }
    }

    #[must_use]
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state != State::Open
    }

    /// Etag of the committed object
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Multipart session id, once the first part has been handed off
    #[must_use]
    pub fn upload_id(&self) -> Option<&str> {
        self.upload.as_ref().and_then(MultipartUpload::upload_id)
    }

    fn check_open(&self) -> Result<()> {
        if self.state != State::Open {
            return Err(FsError::closed_stream(&self.path));
        }
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;

        let part_size = self.shared.config.part_size.max(1);
        while self.buffer.len() >= part_size {
            let part = self.buffer.split_to(part_size).freeze();
            self.submit(part).await?;
        }
        Ok(())
    }

    async fn submit(&mut self, part: Bytes) -> Result<()> {
        let upload = self
            .upload
            .get_or_insert_with(|| MultipartUpload::new(self.path.clone(), Arc::clone(&self.shared)));
        if let Err(err) = upload.submit(part).await {
            self.state = State::Failed;
            self.buffer.clear();
            return Err(err);
        }
        Ok(())
    }

    /// Commit everything written. Closing a committed stream again is a
    /// no-op; closing an aborted or failed one is an error.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            State::Committed => return Ok(()),
            State::Aborted | State::Failed => return Err(FsError::closed_stream(&self.path)),
            State::Open => {}
        }

        let result = if self.upload.is_some() {
            self.commit_multipart().await
        } else {
            let data = self.buffer.split().freeze();
            self.put_whole(data).await
        };
        self.shared.cache.invalidate(&self.path);

        match result {
            Ok(etag) => {
                debug!(
                    "committed {path} ({bytes} bytes)",
                    path: self.path.to_string(),
                    bytes: self.written
                );
                self.etag = Some(etag);
                self.state = State::Committed;
                Ok(())
            }
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    async fn commit_multipart(&mut self) -> Result<String> {
        if !self.buffer.is_empty() {
            let last = self.buffer.split().freeze();
            self.submit(last).await?;
        }
        let Some(upload) = self.upload.as_mut() else {
            return Err(FsError::closed_stream(&self.path));
        };

        if self.mode == PutMode::CreateNew {
            // multipart completion has no precondition; check just before it
            let shared = &self.shared;
            let path = &self.path;
            let existing = shared
                .retry
                .call("head", path, || shared.client.head(path.bucket(), path.key()))
                .await;
            match existing {
                Ok(_) => {
                    _ = upload.abort().await;
                    return Err(FsError::conflict(path, "object already exists"));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    _ = upload.abort().await;
                    return Err(err);
                }
            }
        }
        upload.complete().await
    }

    async fn put_whole(&self, data: Bytes) -> Result<String> {
        let shared = &self.shared;
        let path = &self.path;
        let mode = self.mode;
        if mode == PutMode::Overwrite {
            return shared
                .retry
                .call("put", path, || {
                    shared
                        .client
                        .put(path.bucket(), path.key(), data.clone(), mode)
                })
                .await;
        }

        // A conditional PUT whose response was lost looks like a conflict
        // with ourselves on resend, so check the object before deciding.
        let expected = data.len() as u64;
        let since = Utc::now();
        shared
            .retry
            .call_guarded(
                "put",
                path,
                || {
                    shared
                        .client
                        .put(path.bucket(), path.key(), data.clone(), mode)
                },
                || async move {
                    match shared.client.head(path.bucket(), path.key()).await {
                        Ok(meta)
                            if meta.size == expected
                                && written_since(meta.last_modified, since) =>
                        {
                            Ok(Verdict::Done(meta.etag.unwrap_or_default()))
                        }
                        Ok(_) => Ok(Verdict::Conflict("object already exists".to_string())),
                        Err(err) if err.is_not_found() => Ok(Verdict::Retry),
                        Err(err) => Err(shared.retry.to_fs_error("head", path, err, 1)),
                    }
                },
            )
            .await
    }

    /// Discard everything written and cancel any multipart session
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            State::Aborted | State::Failed => return Ok(()),
            State::Committed => return Err(FsError::closed_stream(&self.path)),
            State::Open => {}
        }
        self.state = State::Aborted;
        self.buffer = BytesMut::new();
        if let Some(upload) = self.upload.as_mut() {
            upload.abort().await?;
        }
        debug!("aborted write to {path}", path: self.path.to_string());
        Ok(())
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        // an open multipart session is aborted by MultipartUpload's own drop
        if self.state == State::Open && self.upload.is_none() && self.written > 0 {
            warn!(
                "write stream for {path} dropped without close; {bytes} bytes discarded",
                path: self.path.to_string(),
                bytes: self.written
            );
        }
    }
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .field("written", &self.written)
            .field("upload", &self.upload)
            .field("state", &self.state)
            .finish()
    }
}

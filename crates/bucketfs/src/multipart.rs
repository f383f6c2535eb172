// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Multipart upload sessions
//!
//! Parts are numbered from 1 in submission order and uploaded as separate
//! tasks, at most `max_part_concurrency` at a time per upload (and no more
//! than the filesystem's worker pool allows overall). The final object is
//! assembled by part number, so completion order never matters.
//!
//! When a part fails for good, the remaining part tasks are cancelled and a
//! single remote abort is issued before the failure is reported.

use crate::client::{ClientError, ClientErrorKind, CompletedPart};
use crate::error::{FsError, Result};
use crate::fs::Shared;
use crate::metadata::written_since;
use crate::path::ObjectPath;
use crate::retry::Verdict;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use diagnostics::*;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

type PartOutcome = (u32, Result<String>);

pub struct MultipartUpload {
    path: ObjectPath,
    shared: Arc<Shared>,
    upload_id: Option<String>,
    initiated_at: Option<DateTime<Utc>>,
    next_part: u32,
    bytes_submitted: u64,
    tasks: JoinSet<PartOutcome>,
    completed: Vec<CompletedPart>,
    /// Completed or aborted; no remote session remains
    finished: bool,
}

impl MultipartUpload {
    pub(crate) fn new(path: ObjectPath, shared: Arc<Shared>) -> Self {
        Self {
            path: path.as_file(),
            shared,
            upload_id: None,
            initiated_at: None,
            next_part: 1,
            bytes_submitted: 0,
            tasks: JoinSet::new(),
            completed: Vec::new(),
            finished: false,
        }
    }

    #[must_use]
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Parts acknowledged by the store so far
    #[must_use]
    pub fn parts_completed(&self) -> usize {
        self.completed.len()
    }

    #[must_use]
    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_submitted
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.upload_id.is_some()
    }

    async fn ensure_initiated(&mut self) -> Result<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let shared = &self.shared;
        let path = &self.path;
        let id = shared
            .retry
            .call("initiate_multipart", path, || {
                shared.client.initiate_multipart(path.bucket(), path.key())
            })
            .await?;
        info!(
            "started multipart upload {upload_id} for {path}",
            upload_id: id.as_str(),
            path: path.to_string()
        );
        self.upload_id = Some(id.clone());
        self.initiated_at = Some(Utc::now());
        Ok(id)
    }

    /// Queue `data` as the next part. Waits while the upload already has
    /// `max_part_concurrency` parts in flight.
    pub async fn submit(&mut self, data: Bytes) -> Result<()> {
        if self.finished {
            return Err(FsError::closed_stream(&self.path));
        }
        let upload_id = match self.ensure_initiated().await {
            Ok(id) => id,
            Err(err) => {
                self.finished = true;
                return Err(err);
            }
        };

        let limit = self.shared.config.max_part_concurrency.max(1);
        while self.tasks.len() >= limit {
            if let Some(joined) = self.tasks.join_next().await {
                self.record(joined).await?;
            }
        }
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined).await?;
        }

        let part_number = self.next_part;
        self.next_part += 1;
        self.bytes_submitted += data.len() as u64;

        debug!(
            "queueing part {part} ({len} bytes) of {path}",
            part: part_number,
            len: data.len(),
            path: self.path.to_string()
        );
        let shared = Arc::clone(&self.shared);
        let path = self.path.clone();
        _ = self.tasks.spawn(async move {
            let result = shared
                .pool
                .run(shared.retry.call("upload_part", &path, || {
                    shared.client.upload_part(
                        path.bucket(),
                        path.key(),
                        &upload_id,
                        part_number,
                        data.clone(),
                    )
                }))
                .await;
            (part_number, result)
        });
        Ok(())
    }

    /// Note a finished part task; a failure aborts the whole upload
    async fn record(
        &mut self,
        joined: std::result::Result<PartOutcome, JoinError>,
    ) -> Result<()> {
        let failure = match joined {
            Ok((part_number, Ok(etag))) => {
                self.completed.push(CompletedPart { part_number, etag });
                return Ok(());
            }
            Ok((part_number, Err(err))) => {
                warn!(
                    "part {part} of {path} failed: {reason}",
                    part: part_number,
                    path: self.path.to_string(),
                    reason: err.to_string()
                );
                err
            }
            Err(join_err) => FsError::Store {
                op: "upload_part",
                path: self.path.to_string(),
                source: ClientError::new(ClientErrorKind::Other, join_err.to_string()),
            },
        };
        Err(self.fail(failure).await)
    }

    /// Wait for every queued part, then commit the parts in part-number order.
    ///
    /// A commit that may have reached the store is never blindly resent: the
    /// object is checked first, and an object written by someone else in the
    /// meantime surfaces as `Conflict`.
    pub async fn complete(&mut self) -> Result<String> {
        if self.finished {
            return Err(FsError::closed_stream(&self.path));
        }
        let upload_id = self.ensure_initiated().await?;
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined).await?;
        }
        self.completed.sort_by_key(|p| p.part_number);

        let result = {
            let shared = &self.shared;
            let path = &self.path;
            let parts = &self.completed;
            let expected = self.bytes_submitted;
            let since = self.initiated_at.unwrap_or_else(Utc::now);
            shared
                .retry
                .call_guarded(
                    "complete_multipart",
                    path,
                    || {
                        shared
                            .client
                            .complete_multipart(path.bucket(), path.key(), &upload_id, parts)
                    },
                    || async move {
                        match shared.client.head(path.bucket(), path.key()).await {
                            Ok(meta) => {
                                let fresh = written_since(meta.last_modified, since);
                                Ok(match (fresh, meta.size == expected) {
                                    (true, true) => Verdict::Done(meta.etag.unwrap_or_default()),
                                    (true, false) => Verdict::Conflict(format!(
                                        "object replaced during upload ({} bytes, expected {expected})",
                                        meta.size
                                    )),
                                    (false, _) => Verdict::Retry,
                                })
                            }
                            Err(err) if err.is_not_found() => Ok(Verdict::Retry),
                            Err(err) => Err(shared.retry.to_fs_error("head", path, err, 1)),
                        }
                    },
                )
                .await
        };

        match result {
            Ok(etag) => {
                self.finished = true;
                info!(
                    "completed multipart upload {upload_id} for {path} ({parts} parts, {bytes} bytes)",
                    upload_id: upload_id.as_str(),
                    path: self.path.to_string(),
                    parts: self.completed.len(),
                    bytes: self.bytes_submitted
                );
                Ok(etag)
            }
            Err(err @ FsError::Conflict { .. }) => {
                _ = self.abort_remote().await;
                Err(err)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Discard the upload. Abort failures are logged and reported, never
    /// retried past the retry policy.
    pub async fn abort(&mut self) -> Result<()> {
        match self.abort_remote().await {
            Ok(()) => Ok(()),
            Err(reason) => Err(FsError::Store {
                op: "abort_multipart",
                path: self.path.to_string(),
                source: ClientError::new(ClientErrorKind::Other, reason),
            }),
        }
    }

    /// Cancel outstanding part tasks and abort the remote session once
    async fn abort_remote(&mut self) -> std::result::Result<(), String> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        let Some(upload_id) = self.upload_id.clone() else {
            return Ok(());
        };
        let shared = &self.shared;
        let path = &self.path;
        let result = shared
            .retry
            .call("abort_multipart", path, || {
                shared
                    .client
                    .abort_multipart(path.bucket(), path.key(), &upload_id)
            })
            .await;
        match result {
            Ok(()) => {
                info!(
                    "aborted multipart upload {upload_id} for {path}",
                    upload_id: upload_id.as_str(),
                    path: path.to_string()
                );
                Ok(())
            }
            // already gone
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                warn!(
                    "failed to abort multipart upload {upload_id} for {path}: {reason}",
                    upload_id: upload_id.as_str(),
                    path: path.to_string(),
                    reason: err.to_string()
                );
                Err(err.to_string())
            }
        }
    }

    async fn fail(&mut self, cause: FsError) -> FsError {
        let abort = self.abort_remote().await;
        FsError::PartialUpload {
            path: self.path.to_string(),
            upload_id: self.upload_id.clone().unwrap_or_default(),
            parts_completed: self.completed.len(),
            abort_succeeded: abort.is_ok(),
            abort_error: abort.err(),
            source: Box::new(cause),
        }
    }
}

impl Drop for MultipartUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // dropping the JoinSet cancels any part still in flight
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let path = self.path.clone();
        warn!(
            "multipart upload {upload_id} for {path} dropped without close; aborting",
            upload_id: upload_id.as_str(),
            path: path.to_string()
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime to abort {upload_id}", upload_id: upload_id.as_str());
            return;
        };
        let client = Arc::clone(&self.shared.client);
        _ = handle.spawn(async move {
            if let Err(err) = client
                .abort_multipart(path.bucket(), path.key(), &upload_id)
                .await
            {
                warn!(
                    "best-effort abort of {upload_id} failed: {reason}",
                    upload_id: upload_id.as_str(),
                    reason: err.to_string()
                );
            }
        });
    }
}

impl std::fmt::Debug for MultipartUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUpload")
            .field("path", &self.path)
            .field("upload_id", &self.upload_id)
            .field("next_part", &self.next_part)
            .field("in_flight", &self.tasks.len())
            .field("completed", &self.completed.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ObjectStoreClient;
    use crate::config::{FsConfig, RetryConfig};
    use crate::memory::{Fault, MemoryStore, Op};
    use chrono::TimeDelta;
    use std::time::Duration;

    fn shared(store: &Arc<MemoryStore>, max_part_concurrency: usize) -> Arc<Shared> {
        let client: Arc<dyn ObjectStoreClient> = Arc::clone(store) as Arc<dyn ObjectStoreClient>;
        let config = FsConfig {
            max_part_concurrency,
            retry: RetryConfig {
                max_attempts: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
                ..RetryConfig::default()
            },
            ..FsConfig::default()
        };
        Arc::new(Shared::new(client, config))
    }

    fn upload(store: &Arc<MemoryStore>, concurrency: usize) -> MultipartUpload {
        MultipartUpload::new(ObjectPath::from_parts("b", "big"), shared(store, concurrency))
    }

    #[tokio::test]
    async fn test_parts_assemble_by_number() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        store.set_latency(Op::UploadPart, Duration::from_millis(5));
        let mut up = upload(&store, 3);
        for chunk in [&b"aaa"[..], b"bbb", b"ccc", b"dd"] {
            up.submit(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        up.complete().await.unwrap();

        assert_eq!(store.object("b", "big").unwrap(), Bytes::from_static(b"aaabbbcccdd"));
        assert_eq!(store.calls(Op::InitiateMultipart), 1);
        assert_eq!(store.calls(Op::UploadPart), 4);
        assert_eq!(store.pending_uploads(), 0);
        assert!(matches!(up.submit(Bytes::new()).await, Err(FsError::ClosedStream(_))));
    }

    #[tokio::test]
    async fn test_failed_part_aborts_once() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        store.inject(Fault::new(Op::UploadPart, ClientError::throttled("slow down")).for_part(2));
        let mut up = upload(&store, 3);
        for _ in 0..3 {
            up.submit(Bytes::from_static(b"part")).await.unwrap();
        }
        let err = up.complete().await.unwrap_err();

        let FsError::PartialUpload {
            abort_succeeded,
            source,
            ..
        } = err
        else {
            panic!("expected PartialUpload, got {err:?}");
        };
        assert!(abort_succeeded);
        assert!(matches!(*source, FsError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(store.calls(Op::AbortMultipart), 1);
        assert_eq!(store.calls(Op::CompleteMultipart), 0);
        assert!(store.object("b", "big").is_none());
        assert_eq!(store.pending_uploads(), 0);

        // terminal afterwards
        assert!(up.abort().await.is_ok());
        assert_eq!(store.calls(Op::AbortMultipart), 1);
    }

    #[tokio::test]
    async fn test_abort_failure_is_attached() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        store.inject(Fault::new(Op::UploadPart, ClientError::access_denied("nope")));
        store.inject(Fault::new(
            Op::AbortMultipart,
            ClientError::new(ClientErrorKind::InvalidRequest, "cannot abort"),
        ));
        let mut up = upload(&store, 1);
        up.submit(Bytes::from_static(b"one")).await.unwrap();
        let err = up.complete().await.unwrap_err();
        match err {
            FsError::PartialUpload {
                abort_succeeded,
                abort_error,
                source,
                ..
            } => {
                assert!(!abort_succeeded);
                assert!(abort_error.unwrap().contains("cannot abort"));
                assert!(matches!(*source, FsError::PermissionDenied { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lost_complete_response_is_not_resent() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        store.inject(
            Fault::new(Op::CompleteMultipart, ClientError::timeout("connection reset"))
                .after_apply()
                .times(1),
        );
        let mut up = upload(&store, 2);
        up.submit(Bytes::from_static(b"hello ")).await.unwrap();
        up.submit(Bytes::from_static(b"world")).await.unwrap();
        up.complete().await.unwrap();

        assert_eq!(store.calls(Op::CompleteMultipart), 1);
        assert_eq!(store.object("b", "big").unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_lost_complete_with_coarse_store_clock() {
        let store = Arc::new(
            MemoryStore::new()
                .with_bucket("b")
                .with_second_timestamps()
                .with_clock_skew(TimeDelta::seconds(-3)),
        );
        store.inject(
            Fault::new(Op::CompleteMultipart, ClientError::timeout("connection reset"))
                .after_apply()
                .times(1),
        );
        let mut up = upload(&store, 2);
        up.submit(Bytes::from_static(b"abcd")).await.unwrap();
        up.submit(Bytes::from_static(b"efgh")).await.unwrap();
        up.complete().await.unwrap();

        assert_eq!(store.calls(Op::CompleteMultipart), 1);
        assert_eq!(store.calls(Op::AbortMultipart), 0);
        assert_eq!(store.object("b", "big").unwrap(), Bytes::from_static(b"abcdefgh"));
    }

    #[tokio::test]
    async fn test_rejected_complete_is_retried() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        store.inject(
            Fault::new(Op::CompleteMultipart, ClientError::timeout("no answer")).times(1),
        );
        let mut up = upload(&store, 2);
        up.submit(Bytes::from_static(b"x")).await.unwrap();
        up.complete().await.unwrap();
        assert_eq!(store.calls(Op::CompleteMultipart), 2);
        assert_eq!(store.object("b", "big").unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_drop_aborts_in_background() {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        let mut up = upload(&store, 2);
        up.submit(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(store.pending_uploads(), 1);
        drop(up);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.pending_uploads(), 0);
    }
}

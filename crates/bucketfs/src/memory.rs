// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory object store
//!
//! Behaves like an S3-compatible store (range reads, paginated delimiter
//! listings, multipart sessions, conditional puts) and adds hooks for tests:
//! per-operation call counters, injected failures and injected latency.

use crate::client::{
    ByteRange, ClientError, ClientErrorKind, ClientResult, CompletedPart, ListPage, ObjectMeta,
    ObjectStoreClient, PutMode,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// S3's default and maximum page size
const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Head,
    Put,
    List,
    InitiateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
    Delete,
    Copy,
}

/// A failure to inject into matching calls
#[derive(Debug, Clone)]
pub struct Fault {
    op: Op,
    error: ClientError,
    key: Option<String>,
    part_number: Option<u32>,
    remaining: Option<usize>,
    after_apply: bool,
}

impl Fault {
    /// Fail every call to `op` with `error`
    #[must_use]
    pub fn new(op: Op, error: ClientError) -> Self {
        Self {
            op,
            error,
            key: None,
            part_number: None,
            remaining: None,
            after_apply: false,
        }
    }

    /// Only the next `n` matching calls fail
    #[must_use]
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    #[must_use]
    pub fn for_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn for_part(mut self, part_number: u32) -> Self {
        self.part_number = Some(part_number);
        self
    }

    /// Perform the operation, then report the failure (a lost response)
    #[must_use]
    pub fn after_apply(mut self) -> Self {
        self.after_apply = true;
        self
    }

    fn matches(&self, op: Op, key: &str, part_number: Option<u32>) -> bool {
        self.op == op
            && self.remaining != Some(0)
            && self.key.as_deref().is_none_or(|k| k == key)
            && (self.part_number.is_none() || self.part_number == part_number)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_etag: u64,
}

impl State {
    fn bucket(&self, bucket: &str) -> ClientResult<&BTreeMap<String, StoredObject>> {
        self.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))
    }

    fn bucket_mut(&mut self, bucket: &str) -> ClientResult<&mut BTreeMap<String, StoredObject>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))
    }

    fn etag(&mut self, suffix: Option<usize>) -> String {
        self.next_etag += 1;
        match suffix {
            Some(parts) => format!("\"{:016x}-{parts}\"", self.next_etag),
            None => format!("\"{:016x}\"", self.next_etag),
        }
    }
}

fn no_such_bucket(bucket: &str) -> ClientError {
    ClientError::new(ClientErrorKind::NotFound, format!("bucket {bucket} does not exist"))
        .with_code("NoSuchBucket")
}

fn no_such_upload(upload_id: &str) -> ClientError {
    ClientError::new(ClientErrorKind::NotFound, format!("upload {upload_id} does not exist"))
        .with_code("NoSuchUpload")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryStore {
    state: Mutex<State>,
    page_size: usize,
    native_copy: bool,
    whole_seconds: bool,
    clock_skew: TimeDelta,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<HashMap<Op, Duration>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: DEFAULT_PAGE_SIZE,
            native_copy: true,
            whole_seconds: false,
            clock_skew: TimeDelta::zero(),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_bucket(self, bucket: &str) -> Self {
        self.create_bucket(bucket);
        self
    }

    /// Cap every LIST page at `page_size` entries (objects plus prefixes)
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Behave like a store with no server-side copy
    #[must_use]
    pub fn without_native_copy(mut self) -> Self {
        self.native_copy = false;
        self
    }

    /// Report `last_modified` at one-second resolution, as S3 does
    #[must_use]
    pub fn with_second_timestamps(mut self) -> Self {
        self.whole_seconds = true;
        self
    }

    /// Offset the store's clock from the local one
    #[must_use]
    pub fn with_clock_skew(mut self, skew: TimeDelta) -> Self {
        self.clock_skew = skew;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now() + self.clock_skew;
        if self.whole_seconds {
            now.trunc_subsecs(0)
        } else {
            now
        }
    }

    pub fn create_bucket(&self, bucket: &str) {
        _ = lock(&self.state)
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    pub fn set_latency(&self, op: Op, latency: Duration) {
        _ = lock(&self.latency).insert(op, latency);
    }

    /// Number of calls made to `op`, failed ones included
    #[must_use]
    pub fn calls(&self, op: Op) -> usize {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Store an object directly, bypassing counters and faults
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = lock(&self.state);
        let etag = state.etag(None);
        _ = state.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                etag,
                last_modified: self.now(),
            },
        );
    }

    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }

    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart sessions initiated but neither completed nor aborted
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    /// Count the call, wait out any latency, and report whether a fault
    /// fires before or after the operation is applied.
    async fn enter(&self, op: Op, key: &str, part_number: Option<u32>) -> ClientResult<Option<ClientError>> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;

        let latency = lock(&self.latency).get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = lock(&self.faults);
        let Some(fault) = faults
            .iter_mut()
            .find(|f| f.matches(op, key, part_number))
        else {
            return Ok(None);
        };
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        if fault.after_apply {
            Ok(Some(fault.error.clone()))
        } else {
            Err(fault.error.clone())
        }
    }

    fn finish<T>(result: ClientResult<T>, late: Option<ClientError>) -> ClientResult<T> {
        match late {
            Some(err) => Err(err),
            None => result,
        }
    }
}

/// Where a continuation token says to resume
enum Resume {
    AfterKey(String),
    AfterPrefix(String),
}

impl Resume {
    fn parse(token: &str) -> ClientResult<Self> {
        if let Some(key) = token.strip_prefix("k:") {
            Ok(Resume::AfterKey(key.to_string()))
        } else if let Some(prefix) = token.strip_prefix("p:") {
            Ok(Resume::AfterPrefix(prefix.to_string()))
        } else {
            Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                format!("bad continuation token {token:?}"),
            ))
        }
    }

    fn skips(&self, key: &str) -> bool {
        match self {
            Resume::AfterKey(last) => key <= last.as_str(),
            Resume::AfterPrefix(prefix) => key <= prefix.as_str() || key.starts_with(prefix),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryStore {
    async fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> ClientResult<Bytes> {
        let late = self.enter(Op::Get, key, None).await?;
        let result = (|| -> ClientResult<Bytes> {
            let state = lock(&self.state);
            let object = state
                .bucket(bucket)?
                .get(key)
                .ok_or_else(|| ClientError::not_found(format!("{bucket}/{key}")))?;
            let len = object.data.len() as u64;
            match range {
                None => Ok(object.data.clone()),
                Some(r) if r.start >= len && !(r.start == 0 && len == 0) => Err(ClientError::new(
                    ClientErrorKind::Server(416),
                    format!("range {} outside object of {len} bytes", r.to_header()),
                )
                .with_code("InvalidRange")),
                Some(r) => {
                    let end = r.end.min(len);
                    Ok(object.data.slice(r.start as usize..end as usize))
                }
            }
        })();
        Self::finish(result, late)
    }

    async fn head(&self, bucket: &str, key: &str) -> ClientResult<ObjectMeta> {
        let late = self.enter(Op::Head, key, None).await?;
        let result = {
            let state = lock(&self.state);
            state.bucket(bucket).and_then(|b| {
                b.get(key)
                    .map(|o| ObjectMeta {
                        key: key.to_string(),
                        size: o.data.len() as u64,
                        etag: Some(o.etag.clone()),
                        last_modified: Some(o.last_modified),
                    })
                    .ok_or_else(|| ClientError::not_found(format!("{bucket}/{key}")))
            })
        };
        Self::finish(result, late)
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes, mode: PutMode) -> ClientResult<String> {
        let late = self.enter(Op::Put, key, None).await?;
        let result = (|| -> ClientResult<String> {
            let mut state = lock(&self.state);
            let etag = state.etag(None);
            let objects = state.bucket_mut(bucket)?;
            if mode == PutMode::CreateNew && objects.contains_key(key) {
                return Err(ClientError::precondition_failed(format!(
                    "{bucket}/{key} already exists"
                )));
            }
            _ = objects.insert(
                key.to_string(),
                StoredObject {
                    data,
                    etag: etag.clone(),
                    last_modified: self.now(),
                },
            );
            Ok(etag)
        })();
        Self::finish(result, late)
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: Option<usize>,
    ) -> ClientResult<ListPage> {
        let late = self.enter(Op::List, prefix, None).await?;
        let resume = continuation_token.map(Resume::parse).transpose()?;
        let limit = max_keys.unwrap_or(self.page_size).min(self.page_size).max(1);

        let result = {
            let state = lock(&self.state);
            state.bucket(bucket).map(|objects| {
                let mut page = ListPage::default();
                let mut emitted = 0usize;
                let mut last: Option<String> = None;

                for (key, object) in objects.range(prefix.to_string()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if resume.as_ref().is_some_and(|r| r.skips(key)) {
                        continue;
                    }
                    let rest = &key[prefix.len()..];
                    let rolled_up = delimiter
                        .filter(|d| !d.is_empty())
                        .and_then(|d| rest.find(d).map(|idx| format!("{prefix}{}", &rest[..idx + d.len()])));

                    match rolled_up {
                        Some(common) => {
                            if page.common_prefixes.last() == Some(&common) {
                                continue;
                            }
                            if emitted == limit {
                                page.next_token = last.take();
                                break;
                            }
                            last = Some(format!("p:{common}"));
                            page.common_prefixes.push(common);
                        }
                        None => {
                            if emitted == limit {
                                page.next_token = last.take();
                                break;
                            }
                            last = Some(format!("k:{key}"));
                            page.objects.push(ObjectMeta {
                                key: key.clone(),
                                size: object.data.len() as u64,
                                etag: Some(object.etag.clone()),
                                last_modified: Some(object.last_modified),
                            });
                        }
                    }
                    emitted += 1;
                }
                page
            })
        };
        Self::finish(result, late)
    }

    async fn initiate_multipart(&self, bucket: &str, key: &str) -> ClientResult<String> {
        let late = self.enter(Op::InitiateMultipart, key, None).await?;
        let result = (|| -> ClientResult<String> {
            let mut state = lock(&self.state);
            state.bucket(bucket)?;
            let upload_id = uuid7::uuid7().to_string();
            _ = state.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })();
        Self::finish(result, late)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ClientResult<String> {
        let late = self.enter(Op::UploadPart, key, Some(part_number)).await?;
        let result = (|| -> ClientResult<String> {
            if part_number == 0 || part_number > 10_000 {
                return Err(ClientError::new(
                    ClientErrorKind::InvalidRequest,
                    format!("part number {part_number} out of range"),
                ));
            }
            let mut state = lock(&self.state);
            let etag = state.etag(None);
            let upload = state
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| no_such_upload(upload_id))?;
            _ = upload.parts.insert(part_number, (etag.clone(), data));
            Ok(etag)
        })();
        Self::finish(result, late)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<String> {
        let late = self.enter(Op::CompleteMultipart, key, None).await?;
        let result = (|| -> ClientResult<String> {
            let mut state = lock(&self.state);
            let upload = state
                .uploads
                .get(upload_id)
                .ok_or_else(|| no_such_upload(upload_id))?;
            if upload.bucket != bucket || upload.key != key {
                return Err(no_such_upload(upload_id));
            }
            if parts.is_empty() {
                return Err(ClientError::new(
                    ClientErrorKind::InvalidRequest,
                    "at least one part is required",
                )
                .with_code("MalformedXML"));
            }

            let mut data = BytesMut::new();
            let mut previous = 0u32;
            for part in parts {
                let stored = upload.parts.get(&part.part_number);
                let valid = part.part_number > previous
                    && stored.is_some_and(|(etag, _)| *etag == part.etag);
                if !valid {
                    return Err(ClientError::new(
                        ClientErrorKind::InvalidRequest,
                        format!("part {} is missing or out of order", part.part_number),
                    )
                    .with_code("InvalidPart"));
                }
                if let Some((_, bytes)) = stored {
                    data.extend_from_slice(bytes);
                }
                previous = part.part_number;
            }

            _ = state.uploads.remove(upload_id);
            let etag = state.etag(Some(parts.len()));
            _ = state.bucket_mut(bucket)?.insert(
                key.to_string(),
                StoredObject {
                    data: data.freeze(),
                    etag: etag.clone(),
                    last_modified: self.now(),
                },
            );
            Ok(etag)
        })();
        Self::finish(result, late)
    }

    async fn abort_multipart(&self, _bucket: &str, key: &str, upload_id: &str) -> ClientResult<()> {
        let late = self.enter(Op::AbortMultipart, key, None).await?;
        let result = lock(&self.state)
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id));
        Self::finish(result, late)
    }

    async fn delete(&self, bucket: &str, key: &str) -> ClientResult<()> {
        let late = self.enter(Op::Delete, key, None).await?;
        let result = lock(&self.state).bucket_mut(bucket).map(|objects| {
            _ = objects.remove(key);
        });
        Self::finish(result, late)
    }

    async fn copy(
        &self,
        bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> ClientResult<String> {
        if !self.native_copy {
            return Err(ClientError::unsupported("copy"));
        }
        let late = self.enter(Op::Copy, src_key, None).await?;
        let result = (|| -> ClientResult<String> {
            let mut state = lock(&self.state);
            let data = state
                .bucket(bucket)?
                .get(src_key)
                .map(|o| o.data.clone())
                .ok_or_else(|| ClientError::not_found(format!("{bucket}/{src_key}")))?;
            let etag = state.etag(None);
            _ = state.bucket_mut(dst_bucket)?.insert(
                dst_key.to_string(),
                StoredObject {
                    data,
                    etag: etag.clone(),
                    last_modified: self.now(),
                },
            );
            Ok(etag)
        })();
        Self::finish(result, late)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new().with_bucket("b");
        for key in ["a/b/", "a/b/x", "a/c", "a/d/e/f", "a/d/g", "z"] {
            store.insert_object("b", key, Bytes::from(key.to_string()));
        }
        store
    }

    async fn list_all(store: &MemoryStore, prefix: &str, delimiter: Option<&str>) -> (Vec<String>, Vec<String>, usize) {
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut pages = 0;
        let mut token: Option<String> = None;
        loop {
            let page = store
                .list("b", prefix, delimiter, token.as_deref(), None)
                .await
                .unwrap();
            pages += 1;
            keys.extend(page.objects.into_iter().map(|o| o.key));
            prefixes.extend(page.common_prefixes);
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        (keys, prefixes, pages)
    }

    #[tokio::test]
    async fn test_delimiter_listing() {
        let store = store();
        let (keys, prefixes, pages) = list_all(&store, "a/", Some("/")).await;
        assert_eq!(keys, vec!["a/c"]);
        assert_eq!(prefixes, vec!["a/b/", "a/d/"]);
        assert_eq!(pages, 1);
    }

    #[tokio::test]
    async fn test_paginated_listing_matches_single_page() {
        let store = store().with_page_size(1);
        let (keys, prefixes, pages) = list_all(&store, "a/", Some("/")).await;
        assert_eq!(keys, vec!["a/c"]);
        assert_eq!(prefixes, vec!["a/b/", "a/d/"]);
        assert_eq!(pages, 3);

        let (keys, _, pages) = list_all(&store, "a/", None).await;
        assert_eq!(keys, vec!["a/b/", "a/b/x", "a/c", "a/d/e/f", "a/d/g"]);
        assert_eq!(pages, 5);
    }

    #[tokio::test]
    async fn test_range_get() {
        let store = MemoryStore::new().with_bucket("b");
        store.insert_object("b", "k", Bytes::from_static(b"0123456789"));
        let bytes = store.get("b", "k", Some(ByteRange::new(2, 5))).await.unwrap();
        assert_eq!(&bytes[..], b"234");
        let bytes = store.get("b", "k", Some(ByteRange::new(8, 100))).await.unwrap();
        assert_eq!(&bytes[..], b"89");
        let err = store.get("b", "k", Some(ByteRange::new(10, 12))).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("InvalidRange"));
    }

    #[tokio::test]
    async fn test_multipart_orders_by_part_number() {
        let store = MemoryStore::new().with_bucket("b");
        let id = store.initiate_multipart("b", "k").await.unwrap();
        let e2 = store.upload_part("b", "k", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        let e1 = store.upload_part("b", "k", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();
        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        store.complete_multipart("b", "k", &id, &parts).await.unwrap();
        assert_eq!(store.object("b", "k").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.pending_uploads(), 0);

        // the session is gone once completed
        let err = store.complete_multipart("b", "k", &id, &parts).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("NoSuchUpload"));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryStore::new().with_bucket("b");
        store.put("b", "k", Bytes::from_static(b"1"), PutMode::CreateNew).await.unwrap();
        let err = store
            .put("b", "k", Bytes::from_static(b"2"), PutMode::CreateNew)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::PreconditionFailed);
        store.put("b", "k", Bytes::from_static(b"3"), PutMode::Overwrite).await.unwrap();
        assert_eq!(store.object("b", "k").unwrap(), Bytes::from_static(b"3"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new().with_bucket("b");
        store.inject(Fault::new(Op::Put, ClientError::throttled("slow")).times(1));
        assert!(store.put("b", "k", Bytes::new(), PutMode::Overwrite).await.is_err());
        assert!(store.object("b", "k").is_none());
        assert!(store.put("b", "k", Bytes::new(), PutMode::Overwrite).await.is_ok());
        assert_eq!(store.calls(Op::Put), 2);

        store.inject(Fault::new(Op::Delete, ClientError::timeout("lost")).after_apply().times(1));
        assert!(store.delete("b", "k").await.is_err());
        assert!(store.object("b", "k").is_none());
    }
}

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the remote object store
//!
//! Everything above this trait speaks in buckets, keys and byte ranges.
//! Implementations translate those calls to a concrete store and report
//! failures as [`ClientError`] so the retry layer can classify them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// HTTP `Range` header value (inclusive end)
    #[must_use]
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Raw object metadata as returned by HEAD or LIST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a LIST call
///
/// `objects` and `common_prefixes` are each in store order (lexicographic for
/// S3-like stores). `next_token` is `None` on the last page.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// A part acknowledged by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Conflict policy for whole-object writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Last writer wins
    #[default]
    Overwrite,
    /// Fail with a precondition error if the key exists (`If-None-Match: *`)
    CreateNew,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientErrorKind {
    Throttled,
    Timeout,
    Network,
    Server(u16),
    NotFound,
    AccessDenied,
    PreconditionFailed,
    InvalidRequest,
    Unsupported,
    Other,
}

/// Error reported by an [`ObjectStoreClient`]
///
/// `code` carries the store's own error code (`SlowDown`, `NoSuchKey`, ...)
/// when one is known; classification may key off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, message).with_code("NoSuchKey")
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Throttled, message).with_code("SlowDown")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Timeout, message).with_code("RequestTimeout")
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::AccessDenied, message).with_code("AccessDenied")
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::PreconditionFailed, message).with_code("PreconditionFailed")
    }

    pub fn unsupported(op: &str) -> Self {
        Self::new(
            ClientErrorKind::Unsupported,
            format!("{op} is not supported by this store"),
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ClientErrorKind::NotFound
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{:?} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ClientError {}

/// Raw operations against a flat bucket/key store
///
/// Implementations perform exactly one remote request per call and never
/// retry internally; retries, timeouts and classification happen in
/// [`crate::retry::RetryPolicy`].
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + 'static {
    /// Fetch an object, or a `[start, end)` slice of it
    async fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> ClientResult<Bytes>;

    async fn head(&self, bucket: &str, key: &str) -> ClientResult<ObjectMeta>;

    /// Store a whole object, returning its etag
    async fn put(&self, bucket: &str, key: &str, data: Bytes, mode: PutMode)
    -> ClientResult<String>;

    /// List keys under `prefix`
    ///
    /// With a delimiter, keys containing the delimiter past the prefix are
    /// rolled up into `common_prefixes`.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: Option<usize>,
    ) -> ClientResult<ListPage>;

    async fn initiate_multipart(&self, bucket: &str, key: &str) -> ClientResult<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ClientResult<String>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<String>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> ClientResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> ClientResult<()>;

    /// Server-side copy. Stores without one keep the default, and callers
    /// fall back to streaming the bytes through.
    async fn copy(
        &self,
        _bucket: &str,
        _src_key: &str,
        _dst_bucket: &str,
        _dst_key: &str,
    ) -> ClientResult<String> {
        Err(ClientError::unsupported("copy"))
    }
}

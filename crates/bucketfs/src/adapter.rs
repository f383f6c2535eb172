// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bridge from the `object_store` crate to [`ObjectStoreClient`]
//!
//! Each bucket name maps to one store instance. `object_store` paths cannot
//! end in a delimiter, so directory marker keys (`a/b/`) are stored as
//! `a/b/.keep` and translated back on the way out.
//!
//! `object_store` has no paginated delimiter listing; every LIST is answered
//! in a single page.

use crate::client::{
    ByteRange, ClientError, ClientErrorKind, ClientResult, CompletedPart, ListPage, ObjectMeta,
    ObjectStoreClient, PutMode,
};
use crate::path::DELIMITER;
use async_trait::async_trait;
use bytes::Bytes;
use diagnostics::*;
use futures::TryStreamExt;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore, PutOptions, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;

const MARKER_NAME: &str = ".keep";

pub struct ObjectStoreAdapter<S> {
    buckets: HashMap<String, Arc<S>>,
}

impl<S> Default for ObjectStoreAdapter<S> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl<S> ObjectStoreAdapter<S>
where
    S: ObjectStore + MultipartStore,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>, store: Arc<S>) -> Self {
        _ = self.buckets.insert(bucket.into(), store);
        self
    }

    fn store(&self, bucket: &str) -> ClientResult<&Arc<S>> {
        self.buckets.get(bucket).ok_or_else(|| {
            ClientError::new(ClientErrorKind::NotFound, format!("bucket {bucket} is not configured"))
                .with_code("NoSuchBucket")
        })
    }
}

/// Store location for a key, with marker keys moved under `.keep`
fn location(key: &str) -> Path {
    if key.ends_with(DELIMITER) {
        Path::from(format!("{key}{MARKER_NAME}"))
    } else {
        Path::from(key)
    }
}

/// Key for a store location, reversing [`location`]
fn key_of(location: &Path) -> String {
    let raw = location.as_ref();
    if location.filename() == Some(MARKER_NAME) {
        raw[..raw.len() - MARKER_NAME.len()].to_string()
    } else {
        raw.to_string()
    }
}

fn meta_of(meta: object_store::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        key: key_of(&meta.location),
        size: meta.size,
        etag: meta.e_tag,
        last_modified: Some(meta.last_modified),
    }
}

fn client_error(err: object_store::Error) -> ClientError {
    use object_store::Error;

    let message = err.to_string();
    match err {
        Error::NotFound { .. } => ClientError::not_found(message),
        Error::AlreadyExists { .. } | Error::Precondition { .. } => {
            ClientError::precondition_failed(message)
        }
        Error::PermissionDenied { .. } | Error::Unauthenticated { .. } => {
            ClientError::access_denied(message)
        }
        Error::NotSupported { .. } | Error::NotImplemented => {
            ClientError::new(ClientErrorKind::Unsupported, message)
        }
        Error::InvalidPath { .. } => ClientError::new(ClientErrorKind::InvalidRequest, message),
        // Transport and server failures arrive as Generic once the store's
        // own retries give up; every permanent condition has its own variant.
        Error::Generic { .. } => ClientError::new(ClientErrorKind::Network, message),
        _ => ClientError::new(ClientErrorKind::Other, message),
    }
}

#[async_trait]
impl<S> ObjectStoreClient for ObjectStoreAdapter<S>
where
    S: ObjectStore + MultipartStore,
{
    async fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> ClientResult<Bytes> {
        let store = self.store(bucket)?;
        let options = GetOptions {
            range: range.map(|r| GetRange::Bounded(r.start..r.end)),
            ..Default::default()
        };
        let result = store
            .get_opts(&location(key), options)
            .await
            .map_err(client_error)?;
        result.bytes().await.map_err(client_error)
    }

    async fn head(&self, bucket: &str, key: &str) -> ClientResult<ObjectMeta> {
        let store = self.store(bucket)?;
        let meta = store.head(&location(key)).await.map_err(client_error)?;
        Ok(meta_of(meta))
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes, mode: PutMode) -> ClientResult<String> {
        let store = self.store(bucket)?;
        let options = PutOptions {
            mode: match mode {
                PutMode::Overwrite => object_store::PutMode::Overwrite,
                PutMode::CreateNew => object_store::PutMode::Create,
            },
            ..Default::default()
        };
        let result = store
            .put_opts(&location(key), PutPayload::from(data), options)
            .await
            .map_err(client_error)?;
        Ok(result.e_tag.unwrap_or_default())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        _continuation_token: Option<&str>,
        _max_keys: Option<usize>,
    ) -> ClientResult<ListPage> {
        let store = self.store(bucket)?;

        // object_store prefixes match whole segments; list the enclosing
        // directory and filter on the full prefix.
        let base = prefix
            .rfind(DELIMITER)
            .map(|idx| Path::from(&prefix[..idx]));
        debug!(
            "list {bucket}/{prefix} delimited={delimited}",
            bucket: bucket,
            prefix: prefix,
            delimited: delimiter.is_some()
        );

        let mut page = ListPage::default();
        if delimiter.is_some() {
            let result = store
                .list_with_delimiter(base.as_ref())
                .await
                .map_err(client_error)?;
            page.objects = result
                .objects
                .into_iter()
                .map(meta_of)
                .filter(|m| m.key.starts_with(prefix))
                .collect();
            page.common_prefixes = result
                .common_prefixes
                .into_iter()
                .map(|p| format!("{}{DELIMITER}", p.as_ref()))
                .filter(|p| p.starts_with(prefix))
                .collect();
            page.objects.sort_by(|a, b| a.key.cmp(&b.key));
        } else {
            let mut objects: Vec<ObjectMeta> = store
                .list(base.as_ref())
                .map_ok(meta_of)
                .try_filter(|m| futures::future::ready(m.key.starts_with(prefix)))
                .try_collect()
                .await
                .map_err(client_error)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            page.objects = objects;
        }
        page.common_prefixes.sort();
        Ok(page)
    }

    async fn initiate_multipart(&self, bucket: &str, key: &str) -> ClientResult<String> {
        let store = self.store(bucket)?;
        store
            .create_multipart(&location(key))
            .await
            .map_err(client_error)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ClientResult<String> {
        let store = self.store(bucket)?;
        let part_idx = part_number.checked_sub(1).ok_or_else(|| {
            ClientError::new(ClientErrorKind::InvalidRequest, "part numbers start at 1")
        })? as usize;
        let part = store
            .put_part(
                &location(key),
                &upload_id.to_string(),
                part_idx,
                PutPayload::from(data),
            )
            .await
            .map_err(client_error)?;
        Ok(part.content_id)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<String> {
        let store = self.store(bucket)?;
        let parts = parts
            .iter()
            .map(|p| PartId {
                content_id: p.etag.clone(),
            })
            .collect();
        let result = store
            .complete_multipart(&location(key), &upload_id.to_string(), parts)
            .await
            .map_err(client_error)?;
        Ok(result.e_tag.unwrap_or_default())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> ClientResult<()> {
        let store = self.store(bucket)?;
        store
            .abort_multipart(&location(key), &upload_id.to_string())
            .await
            .map_err(client_error)
    }

    async fn delete(&self, bucket: &str, key: &str) -> ClientResult<()> {
        let store = self.store(bucket)?;
        store.delete(&location(key)).await.map_err(client_error)
    }

    async fn copy(
        &self,
        bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> ClientResult<String> {
        let src = self.store(bucket)?;
        let dst = self.store(dst_bucket)?;
        if !Arc::ptr_eq(src, dst) {
            return Err(ClientError::unsupported("copy between stores"));
        }
        src.copy(&location(src_key), &location(dst_key))
            .await
            .map_err(client_error)?;
        let meta = src.head(&location(dst_key)).await.map_err(client_error)?;
        Ok(meta.e_tag.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::retry::{ErrorClass, RetryPolicy};
    use object_store::memory::InMemory;
    use std::time::Duration;

    fn adapter() -> ObjectStoreAdapter<InMemory> {
        ObjectStoreAdapter::new().with_bucket("b", Arc::new(InMemory::new()))
    }

    #[test]
    fn test_marker_locations() {
        assert_eq!(location("a/b/").as_ref(), "a/b/.keep");
        assert_eq!(key_of(&location("a/b/")), "a/b/");
        assert_eq!(key_of(&location("a/b")), "a/b");
    }

    #[test]
    fn test_generic_failures_are_transient() {
        let policy = RetryPolicy::new(RetryConfig::default(), Duration::from_secs(1));
        let err = client_error(object_store::Error::Generic {
            store: "S3",
            source: "connection reset by peer".into(),
        });
        assert_eq!(err.kind, ClientErrorKind::Network);
        assert_eq!(policy.classify(&err), ErrorClass::Retryable);

        let err = client_error(object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        });
        assert_eq!(policy.classify(&err), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_put_get_range() {
        let client = adapter();
        client
            .put("b", "a/file", Bytes::from_static(b"0123456789"), PutMode::Overwrite)
            .await
            .unwrap();
        let bytes = client
            .get("b", "a/file", Some(ByteRange::new(3, 6)))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"345");
        assert_eq!(client.head("b", "a/file").await.unwrap().size, 10);

        let err = client.head("b", "a/missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = client.head("nope", "a/file").await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("NoSuchBucket"));
    }

    #[tokio::test]
    async fn test_create_new_conflicts() {
        let client = adapter();
        client
            .put("b", "k", Bytes::from_static(b"1"), PutMode::CreateNew)
            .await
            .unwrap();
        let err = client
            .put("b", "k", Bytes::from_static(b"2"), PutMode::CreateNew)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_delimited_listing_with_markers() {
        let client = adapter();
        for key in ["a/", "a/x", "a/sub/", "a/sub/y", "ab"] {
            client
                .put("b", key, Bytes::from(key.to_string()), PutMode::Overwrite)
                .await
                .unwrap();
        }

        let page = client.list("b", "a/", Some("/"), None, None).await.unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "a/x"]);
        assert_eq!(page.common_prefixes, vec!["a/sub/"]);
        assert!(page.next_token.is_none());

        let page = client.list("b", "a/", None, None, None).await.unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "a/sub/", "a/sub/y", "a/x"]);
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let client = adapter();
        let id = client.initiate_multipart("b", "big").await.unwrap();
        let e1 = client
            .upload_part("b", "big", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let e2 = client
            .upload_part("b", "big", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let parts = [
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        client
            .complete_multipart("b", "big", &id, &parts)
            .await
            .unwrap();
        let bytes = client.get("b", "big", None).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }
}

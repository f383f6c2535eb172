// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The filesystem facade
//!
//! [`BucketFs`] resolves string paths, consults the metadata cache, and
//! drives the directory tree and the read/write streams. Every operation
//! that changes the store invalidates the touched paths (and, through the
//! cache, their ancestors' listings).
//!
//! Moves are copy-then-delete and are not atomic: a failure between the two
//! steps leaves both source and destination in place and is reported as
//! [`FsError::PartialMove`].

use crate::cache::{CacheStats, MetadataCache};
use crate::client::{ByteRange, ClientErrorKind, ObjectStoreClient, PutMode};
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::metadata::ObjectInfo;
use crate::path::{ObjectPath, PathResolver};
use crate::pool::WorkerPool;
use crate::read::ReadStream;
use crate::retry::RetryPolicy;
use crate::tree::DirectoryTree;
use crate::write::WriteStream;
use bytes::Bytes;
use diagnostics::*;
use std::sync::Arc;

/// State shared by the facade and every stream it opens
pub(crate) struct Shared {
    pub(crate) client: Arc<dyn ObjectStoreClient>,
    pub(crate) retry: RetryPolicy,
    pub(crate) cache: MetadataCache,
    pub(crate) pool: WorkerPool,
    pub(crate) config: FsConfig,
}

impl Shared {
    #[cfg(test)]
    pub(crate) fn new(client: Arc<dyn ObjectStoreClient>, config: FsConfig) -> Self {
        let retry = RetryPolicy::new(config.retry.clone(), config.request_timeout);
        Self::with_retry(client, config, retry)
    }

    pub(crate) fn with_retry(
        client: Arc<dyn ObjectStoreClient>,
        config: FsConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            retry,
            cache: MetadataCache::new(config.cache_ttl, config.single_flight),
            pool: WorkerPool::new(config.worker_pool_size),
            config,
        }
    }

    /// HEAD the object at `path`, bypassing the cache
    pub(crate) async fn head(&self, path: &ObjectPath) -> Result<ObjectInfo> {
        let meta = self
            .retry
            .call("head", path, || self.client.head(path.bucket(), path.key()))
            .await?;
        Ok(ObjectInfo::from_meta(path.bucket(), meta))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or replace
    Write,
    /// Create only; an existing object makes the commit fail with `Conflict`
    CreateNew,
}

/// An open file: either end of the stream, closed the same way
#[derive(Debug)]
pub enum FileHandle {
    Read(ReadStream),
    Write(WriteStream),
}

impl FileHandle {
    #[must_use]
    pub fn path(&self) -> &ObjectPath {
        match self {
            FileHandle::Read(r) => r.path(),
            FileHandle::Write(w) => w.path(),
        }
    }

    /// Release a reader, or commit a writer
    pub async fn close(&mut self) -> Result<()> {
        match self {
            FileHandle::Read(r) => r.close(),
            FileHandle::Write(w) => w.close().await,
        }
    }

    #[must_use]
    pub fn into_reader(self) -> Option<ReadStream> {
        match self {
            FileHandle::Read(r) => Some(r),
            FileHandle::Write(_) => None,
        }
    }

    #[must_use]
    pub fn into_writer(self) -> Option<WriteStream> {
        match self {
            FileHandle::Write(w) => Some(w),
            FileHandle::Read(_) => None,
        }
    }
}

pub struct BucketFs {
    resolver: PathResolver,
    shared: Arc<Shared>,
    tree: DirectoryTree,
}

impl BucketFs {
    pub fn new(client: Arc<dyn ObjectStoreClient>, config: FsConfig) -> Result<Self> {
        let retry = RetryPolicy::new(config.retry.clone(), config.request_timeout);
        Self::with_retry_policy(client, config, retry)
    }

    /// Use a preconfigured retry policy, e.g. one with a custom classifier
    pub fn with_retry_policy(
        client: Arc<dyn ObjectStoreClient>,
        config: FsConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = PathResolver::new(config.protocols.iter().cloned());
        let tree = DirectoryTree::new(Arc::clone(&client), retry.clone(), config.list_page_size);
        Ok(Self {
            resolver,
            shared: Arc::new(Shared::with_retry(client, config, retry)),
            tree,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.shared.config
    }

    pub fn resolve(&self, path: &str) -> Result<ObjectPath> {
        self.resolver.resolve(path)
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let path = self.resolve(path)?;
        if path.is_bucket_root() || path.is_dir_intent() {
            return Err(FsError::invalid_path(path.to_string(), "not a file path"));
        }
        match mode {
            OpenMode::Read => {
                let info = self.stat_path(&path).await?;
                if info.is_directory {
                    return Err(FsError::invalid_path(path.to_string(), "is a directory"));
                }
                Ok(FileHandle::Read(ReadStream::new(
                    path,
                    Arc::clone(&self.shared),
                    Some(info.size),
                )))
            }
            OpenMode::Write => Ok(FileHandle::Write(WriteStream::new(
                path,
                Arc::clone(&self.shared),
                PutMode::Overwrite,
            ))),
            OpenMode::CreateNew => Ok(FileHandle::Write(WriteStream::new(
                path,
                Arc::clone(&self.shared),
                PutMode::CreateNew,
            ))),
        }
    }

    pub async fn open_read(&self, path: &str) -> Result<ReadStream> {
        self.open(path, OpenMode::Read)
            .await?
            .into_reader()
            .ok_or_else(|| FsError::invalid_path(path, "not opened for reading"))
    }

    pub async fn open_write(&self, path: &str) -> Result<WriteStream> {
        self.open(path, OpenMode::Write)
            .await?
            .into_writer()
            .ok_or_else(|| FsError::invalid_path(path, "not opened for writing"))
    }

    /// Metadata for a file or directory, served from the cache when fresh
    pub async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let path = self.resolve(path)?;
        self.stat_path(&path).await
    }

    async fn stat_path(&self, path: &ObjectPath) -> Result<ObjectInfo> {
        if path.is_bucket_root() {
            return Ok(ObjectInfo::directory(path));
        }
        self.shared
            .cache
            .get_or_fetch(path, || self.lookup(path))
            .await
    }

    /// Uncached lookup: the object itself, then anything under its prefix
    async fn lookup(&self, path: &ObjectPath) -> Result<ObjectInfo> {
        if !path.is_dir_intent() {
            match self.shared.head(path).await {
                Ok(info) => return Ok(info),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let dir = path.as_dir();
        let prefix = dir.dir_prefix();
        let page = self
            .shared
            .retry
            .call("list", &dir, || {
                self.shared
                    .client
                    .list(dir.bucket(), &prefix, None, None, Some(1))
            })
            .await?;
        if page.objects.is_empty() && page.common_prefixes.is_empty() {
            return Err(FsError::not_found(path));
        }
        Ok(ObjectInfo::directory(&dir))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Directory entries in store order. Empty directories are only visible
    /// through their marker objects.
    pub async fn listdir(&self, path: &str, recursive: bool) -> Result<Vec<ObjectInfo>> {
        let dir = self.resolve(path)?.as_dir();
        if let Some(entries) = self.shared.cache.get_listing(&dir, recursive) {
            return Ok(entries);
        }

        let entries = match self.tree.list(&dir, recursive).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => {
                let file = dir.as_file();
                return match self.shared.head(&file).await {
                    Ok(_) => Err(FsError::not_a_directory(file)),
                    Err(head_err) if head_err.is_not_found() => Err(err),
                    Err(head_err) => Err(head_err),
                };
            }
            Err(err) => return Err(err),
        };

        self.shared
            .cache
            .put_listing(&dir, recursive, entries.clone(), None);
        for entry in &entries {
            self.shared.cache.put(&entry.path, entry.clone(), None);
        }
        Ok(entries)
    }

    /// Create a directory by writing its zero-byte marker. Creating an
    /// existing directory is a no-op.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?.as_dir();
        if dir.is_bucket_root() {
            return Ok(());
        }
        match self.shared.head(&dir.as_file()).await {
            Ok(_) => return Err(FsError::already_exists(dir.as_file())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        self.put_marker(&dir).await?;
        info!("created directory {path}", path: dir.to_string());
        Ok(())
    }

    async fn put_marker(&self, dir: &ObjectPath) -> Result<()> {
        let shared = &self.shared;
        let result = shared
            .retry
            .call("put", dir, || {
                shared
                    .client
                    .put(dir.bucket(), dir.key(), Bytes::new(), PutMode::Overwrite)
            })
            .await;
        shared.cache.invalidate(dir);
        result.map(|_| ())
    }

    /// Delete a file, or a directory with everything below it when
    /// `recursive`. A non-empty directory without `recursive` is refused.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let path = self.resolve(path)?;
        let info = self.lookup(&path).await?;

        if !info.is_directory {
            self.delete_key(&path).await?;
            info!("removed {path}", path: path.to_string());
            return Ok(());
        }

        let dir = path.as_dir();
        if !recursive {
            if dir.is_bucket_root() || self.tree.has_children(&dir).await? {
                return Err(FsError::directory_not_empty(&dir));
            }
            self.delete_key(&dir).await?;
            info!("removed directory {path}", path: dir.to_string());
            return Ok(());
        }

        let listing = self.tree.scan(&dir, true).await?;
        let mut targets: Vec<ObjectPath> = listing.entries.into_iter().map(|e| e.path).collect();
        if listing.marker_seen {
            targets.push(dir.clone());
        }
        let count = targets.len();
        let deleted = self.delete_all(targets).await;
        self.shared.cache.invalidate(&dir);
        deleted?;
        info!("removed {path} ({count} keys)", path: dir.to_string(), count: count);
        Ok(())
    }

    async fn delete_key(&self, path: &ObjectPath) -> Result<()> {
        let shared = &self.shared;
        let result = shared
            .retry
            .call("delete", path, || {
                shared.client.delete(path.bucket(), path.key())
            })
            .await;
        shared.cache.invalidate(path);
        result
    }

    /// Delete keys through the worker pool, children before their markers.
    /// Every target is dropped from the cache whether or not its delete
    /// went through.
    async fn delete_all(&self, targets: Vec<ObjectPath>) -> Result<()> {
        let shared = &self.shared;
        let results = shared
            .pool
            .map(targets, |target| async move {
                let result = shared
                    .retry
                    .call("delete", &target, || {
                        shared.client.delete(target.bucket(), target.key())
                    })
                    .await;
                shared.cache.invalidate(&target);
                result
            })
            .await;
        results.into_iter().collect()
    }

    /// Copy a file, or a directory tree
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.resolve(src)?;
        let dst = self.resolve(dst)?;
        self.copy_paths(&src, &dst).await.map(|_| ())
    }

    /// Copy `src` to `dst` and return the source keys that were copied
    async fn copy_paths(&self, src: &ObjectPath, dst: &ObjectPath) -> Result<Vec<ObjectPath>> {
        let info = self.lookup(src).await?;
        if !info.is_directory {
            let target = if dst.is_dir_intent() {
                ObjectPath::from_parts(dst.bucket(), format!("{}{}", dst.dir_prefix(), src.name()))
            } else {
                dst.clone()
            };
            self.copy_object(src, &target, info.size).await?;
            self.shared.cache.invalidate(&target);
            return Ok(vec![src.clone()]);
        }

        let src_dir = src.as_dir();
        let dst_dir = dst.as_dir();
        if src_dir == dst_dir || src_dir.contains(&dst_dir) {
            return Err(FsError::invalid_path(
                dst.to_string(),
                "destination lies inside the source directory",
            ));
        }

        let listing = self.tree.scan(&src_dir, true).await?;
        let mut sources = Vec::with_capacity(listing.entries.len() + 1);
        let mut jobs = Vec::with_capacity(listing.entries.len() + 1);
        for entry in listing.entries {
            if let Some(target) = src_dir.rebase(&entry.path, &dst_dir) {
                sources.push(entry.path.clone());
                jobs.push((entry, target));
            }
        }
        // children before their markers when deleting
        sources.reverse();
        if listing.marker_seen || jobs.is_empty() {
            jobs.push((ObjectInfo::directory(&src_dir), dst_dir.clone()));
            if listing.marker_seen {
                sources.push(src_dir.clone());
            }
        }

        let results = self
            .shared
            .pool
            .map(jobs, |(entry, target)| async move {
                if entry.is_directory {
                    self.put_marker(&target).await
                } else {
                    self.copy_object(&entry.path, &target, entry.size).await
                }
            })
            .await;
        let copied = results.into_iter().collect::<Result<Vec<()>>>();
        self.shared.cache.invalidate(&dst_dir);
        copied?;
        Ok(sources)
    }

    /// Server-side copy when the client has one, streamed otherwise
    async fn copy_object(&self, src: &ObjectPath, dst: &ObjectPath, size: u64) -> Result<()> {
        let shared = &self.shared;
        let native = shared
            .retry
            .call("copy", src, || {
                shared
                    .client
                    .copy(src.bucket(), src.key(), dst.bucket(), dst.key())
            })
            .await;
        match native {
            Ok(_) => return Ok(()),
            Err(FsError::Store { source, .. }) if source.kind == ClientErrorKind::Unsupported => {}
            Err(err) => return Err(err),
        }

        debug!(
            "streaming copy {src} -> {dst}",
            src: src.to_string(),
            dst: dst.to_string()
        );
        let mut reader = ReadStream::new(src.clone(), Arc::clone(shared), Some(size));
        let mut writer = WriteStream::new(dst.clone(), Arc::clone(shared), PutMode::Overwrite);
        let chunk = shared.config.part_size;
        let streamed: Result<()> = async {
            loop {
                let bytes = reader.read(chunk).await?;
                if bytes.is_empty() {
                    break;
                }
                writer.write(&bytes).await?;
            }
            writer.close().await
        }
        .await;
        reader.close()?;
        if streamed.is_err() {
            _ = writer.abort().await;
        }
        streamed
    }

    /// Move by copy-then-delete. If the copy succeeds but deleting the
    /// source fails, both copies remain and `PartialMove` is returned.
    pub async fn mv(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        if src_path.is_bucket_root() {
            return Err(FsError::invalid_path(src, "cannot move a bucket root"));
        }
        if src_path.as_file() == dst_path.as_file() {
            return Ok(());
        }

        let sources = self.copy_paths(&src_path, &dst_path).await?;
        let deleted = self.delete_all(sources).await;
        self.shared.cache.invalidate(&src_path);
        self.shared.cache.invalidate(&dst_path);

        match deleted {
            Ok(()) => {
                info!("moved {src} to {dst}", src: src_path.to_string(), dst: dst_path.to_string());
                Ok(())
            }
            Err(err) => {
                warn!(
                    "move of {src} left the source in place: {reason}",
                    src: src_path.to_string(),
                    reason: err.to_string()
                );
                Err(FsError::PartialMove {
                    src: src_path.to_string(),
                    dst: dst_path.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.mv(src, dst).await
    }

    /// Total bytes stored at or below `path`
    pub async fn du(&self, path: &str) -> Result<u64> {
        let path = self.resolve(path)?;
        let info = self.stat_path(&path).await?;
        if !info.is_directory {
            return Ok(info.size);
        }
        let listing = self.tree.scan(&path.as_dir(), true).await?;
        Ok(listing
            .entries
            .iter()
            .filter(|e| !e.is_directory)
            .map(|e| e.size)
            .sum())
    }

    /// Whole object contents
    pub async fn cat(&self, path: &str) -> Result<Bytes> {
        let mut reader = self.open_read(path).await?;
        let bytes = reader.read_to_end().await;
        reader.close()?;
        bytes
    }

    /// Bytes `[start, end)` of an object, clamped to its size
    pub async fn cat_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        let path = self.resolve(path)?;
        let info = self.stat_path(&path).await?;
        if info.is_directory {
            return Err(FsError::invalid_path(path.to_string(), "is a directory"));
        }
        let end = end.min(info.size);
        if start >= end {
            return Ok(Bytes::new());
        }
        let range = ByteRange::new(start, end);
        let shared = &self.shared;
        shared
            .retry
            .call("get", &path, || {
                shared.client.get(path.bucket(), path.key(), Some(range))
            })
            .await
    }

    /// Write a whole object in one call
    pub async fn pipe(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.open_write(path).await?;
        if let Err(err) = writer.write(data).await {
            _ = writer.abort().await;
            return Err(err);
        }
        writer.close().await
    }

    /// Drop cached metadata for `path` (and its ancestors' listings), or
    /// everything when `path` is `None`.
    pub fn invalidate_cache(&self, path: Option<&str>) -> Result<()> {
        match path {
            Some(path) => {
                let path = self.resolve(path)?;
                self.shared.cache.invalidate(&path);
            }
            None => self.shared.cache.invalidate_all(),
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }
}

impl std::fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketFs")
            .field("config", &self.shared.config)
            .field("cache", &self.shared.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::memory::{Fault, MemoryStore, Op};

    fn fs_with(store: &Arc<MemoryStore>, config: FsConfig) -> BucketFs {
        let client: Arc<dyn ObjectStoreClient> = Arc::clone(store) as Arc<dyn ObjectStoreClient>;
        BucketFs::new(client, config).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, BucketFs) {
        let store = Arc::new(MemoryStore::new().with_bucket("b"));
        let fs = fs_with(&store, FsConfig::default());
        (store, fs)
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let client: Arc<dyn ObjectStoreClient> = store;
        let config = FsConfig {
            part_size: 0,
            ..FsConfig::default()
        };
        assert!(matches!(
            BucketFs::new(client, config),
            Err(FsError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_stat_is_cache_first() {
        let (store, fs) = setup();
        store.insert_object("b", "f", Bytes::from_static(b"12345"));

        assert_eq!(fs.stat("s3://b/f").await.unwrap().size, 5);
        assert_eq!(fs.stat("b/f").await.unwrap().size, 5);
        assert_eq!(store.calls(Op::Head), 1);
        assert_eq!(fs.cache_stats().hits, 1);

        fs.invalidate_cache(Some("b/f")).unwrap();
        fs.stat("b/f").await.unwrap();
        assert_eq!(store.calls(Op::Head), 2);
    }

    #[tokio::test]
    async fn test_stat_directories() {
        let (store, fs) = setup();
        store.insert_object("b", "implied/deep/x", Bytes::new());

        let info = fs.stat("b/implied").await.unwrap();
        assert!(info.is_directory);
        assert_eq!(info.path.to_string(), "b/implied/");
        assert!(fs.stat("b/").await.unwrap().is_directory);
        assert!(fs.stat("b/missing").await.unwrap_err().is_not_found());
        assert!(!fs.exists("b/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_listdir() {
        let (_store, fs) = setup();
        fs.mkdir("b/a/b/").await.unwrap();
        fs.pipe("b/a/c", b"data").await.unwrap();

        let entries = fs.listdir("b/a/", false).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name().to_string(), e.is_directory)).collect();
        assert_eq!(names, vec![("b".to_string(), true), ("c".to_string(), false)]);

        // idempotent
        fs.mkdir("b/a/b").await.unwrap();
        assert!(matches!(fs.mkdir("b/a/c").await, Err(FsError::AlreadyExists(_))));
        assert!(matches!(fs.listdir("b/a/c", false).await, Err(FsError::NotADirectory(_))));
        assert!(fs.listdir("b/zzz", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_writes_invalidate_parent_listing() {
        let (store, fs) = setup();
        fs.mkdir("b/d").await.unwrap();
        assert!(fs.listdir("b/d", false).await.unwrap().is_empty());
        let lists = store.calls(Op::List);

        // cached
        fs.listdir("b/d", false).await.unwrap();
        assert_eq!(store.calls(Op::List), lists);

        fs.pipe("b/d/new", b"x").await.unwrap();
        assert_eq!(fs.listdir("b/d", false).await.unwrap().len(), 1);
        assert!(store.calls(Op::List) > lists);
    }

    #[tokio::test]
    async fn test_open_modes() {
        let (_store, fs) = setup();
        assert!(fs.open("b/nope", OpenMode::Read).await.unwrap_err().is_not_found());
        assert!(matches!(
            fs.open("b/dir/", OpenMode::Write).await,
            Err(FsError::InvalidPath { .. })
        ));

        let mut handle = fs.open("b/f", OpenMode::CreateNew).await.unwrap();
        if let FileHandle::Write(w) = &mut handle {
            w.write(b"once").await.unwrap();
        }
        handle.close().await.unwrap();

        let mut again = fs.open("b/f", OpenMode::CreateNew).await.unwrap();
        assert!(again.close().await.unwrap_err().is_conflict());

        let mut reader = fs.open("b/f", OpenMode::Read).await.unwrap();
        assert_eq!(reader.path().to_string(), "b/f");
        reader.close().await.unwrap();
        assert_eq!(fs.cat("b/f").await.unwrap(), Bytes::from_static(b"once"));
        assert_eq!(fs.cat_range("b/f", 1, 100).await.unwrap(), Bytes::from_static(b"nce"));
        assert!(fs.cat_range("b/f", 10, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, fs) = setup();
        fs.mkdir("b/d").await.unwrap();
        fs.pipe("b/d/x", b"1").await.unwrap();
        fs.pipe("b/d/sub/y", b"22").await.unwrap();

        assert!(matches!(fs.remove("b/d", false).await, Err(FsError::DirectoryNotEmpty(_))));
        assert_eq!(fs.du("b/d").await.unwrap(), 3);

        fs.remove("b/d/x", false).await.unwrap();
        fs.remove("b/d", true).await.unwrap();
        assert!(store.keys("b").is_empty());
        assert!(!fs.exists("b/d").await.unwrap());
        assert!(fs.remove("b/d", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_recursive_remove_still_invalidates() {
        let (store, fs) = setup();
        fs.pipe("b/d/x", b"1").await.unwrap();
        fs.pipe("b/d/y", b"2").await.unwrap();
        assert_eq!(fs.listdir("b/d/", false).await.unwrap().len(), 2);
        assert!(fs.exists("b/d/x").await.unwrap());

        store.inject(Fault::new(Op::Delete, ClientError::access_denied("denied")).for_key("d/y"));
        let err = fs.remove("b/d", true).await.unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied { .. }));
        assert_eq!(store.keys("b"), vec!["d/y"]);

        let names: Vec<_> = fs
            .listdir("b/d/", false)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(names, vec!["b/d/y"]);
        assert!(!fs.exists("b/d/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_tree_copy_still_invalidates() {
        let (store, fs) = setup();
        fs.pipe("b/src/a", b"1").await.unwrap();
        fs.pipe("b/src/b", b"2").await.unwrap();
        fs.mkdir("b/dst/").await.unwrap();
        assert!(fs.listdir("b/dst/", false).await.unwrap().is_empty());

        store.inject(Fault::new(Op::Copy, ClientError::access_denied("denied")).for_key("src/b"));
        assert!(fs.copy("b/src", "b/dst").await.is_err());

        let names: Vec<_> = fs
            .listdir("b/dst/", false)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(names, vec!["b/dst/a"]);
    }

    #[tokio::test]
    async fn test_move_file_and_tree() {
        let (store, fs) = setup();
        fs.pipe("b/src/one", b"1").await.unwrap();
        fs.pipe("b/src/deep/two", b"22").await.unwrap();
        fs.mkdir("b/src/empty").await.unwrap();

        fs.mv("b/src/one", "b/moved").await.unwrap();
        assert_eq!(fs.cat("b/moved").await.unwrap(), Bytes::from_static(b"1"));
        assert!(!fs.exists("b/src/one").await.unwrap());

        fs.mv("b/src", "b/dst").await.unwrap();
        assert_eq!(
            store.keys("b"),
            vec!["dst/deep/two", "dst/empty/", "moved"]
        );
        assert!(fs.listdir("b/dst/empty", false).await.unwrap().is_empty());
        assert!(matches!(
            fs.mv("b/dst", "b/dst/inner").await,
            Err(FsError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_reports_partial_failure() {
        let (store, fs) = setup();
        fs.pipe("b/s", b"data").await.unwrap();
        store.inject(Fault::new(Op::Delete, ClientError::access_denied("no delete")));

        let err = fs.mv("b/s", "b/t").await.unwrap_err();
        assert!(matches!(err, FsError::PartialMove { .. }));
        assert!(store.object("b", "s").is_some());
        assert!(store.object("b", "t").is_some());
    }

    #[tokio::test]
    async fn test_copy_without_native_support_streams() {
        let store = Arc::new(MemoryStore::new().with_bucket("b").without_native_copy());
        let fs = fs_with(
            &store,
            FsConfig {
                part_size: 4,
                ..FsConfig::default()
            },
        );
        fs.pipe("b/src", b"0123456789").await.unwrap();
        fs.copy("b/src", "b/dir/").await.unwrap();
        assert_eq!(fs.cat("b/dir/src").await.unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(store.calls(Op::Copy), 0);
    }
}

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Filesystem semantics over flat object stores
//!
//! Object stores offer buckets of keys with range reads, whole or multipart
//! writes and prefix listings. This crate layers paths, directories, stat and
//! seekable streams on top, while absorbing the store's latency, throttling
//! and partial failures.
//!
//! # Architecture
//!
//! - **PathResolver**: lexical normalization of `bucket/key` paths
//! - **RetryPolicy**: error classification and exponential backoff, with a
//!   verification step for calls that must not be blindly resent
//! - **MetadataCache**: TTL cache for stat results and listings, optionally
//!   coalescing concurrent misses
//! - **DirectoryTree**: pseudo-directories from paginated delimiter listings
//! - **ReadStream**: range GETs behind one readahead window
//! - **WriteStream** / **MultipartUpload**: buffered writes, concurrent part
//!   uploads, abort on failure
//! - **BucketFs**: the facade tying them together
//!
//! Any store reachable through [`ObjectStoreClient`] can be used;
//! [`ObjectStoreAdapter`] covers everything the `object_store` crate supports
//! and [`MemoryStore`] is an in-process store for tests.
//!
//! # Usage
//!
//! ```no_run
//! # async fn example() -> bucketfs::Result<()> {
//! use bucketfs::{BucketFs, FsConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new().with_bucket("data"));
//! let fs = BucketFs::new(store, FsConfig::default())?;
//!
//! fs.mkdir("data/reports/").await?;
//! let mut out = fs.open_write("data/reports/q1.csv").await?;
//! out.write(b"region,total\n").await?;
//! out.close().await?;
//!
//! for entry in fs.listdir("data/reports/", false).await? {
//!     println!("{} {}", entry.path, entry.size);
//! }
//! # Ok(())
//! # }
//! ```

mod adapter;
mod cache;
mod client;
mod config;
mod error;
mod fs;
pub mod memory;
mod metadata;
mod multipart;
mod path;
mod pool;
mod read;
mod retry;
mod tree;
mod write;

pub use adapter::ObjectStoreAdapter;
pub use cache::{CacheStats, MetadataCache};
pub use client::{
    ByteRange, ClientError, ClientErrorKind, ClientResult, CompletedPart, ListPage, ObjectMeta,
    ObjectStoreClient, PutMode,
};
pub use config::{FsConfig, MIB, PART_SIZE_DEFAULT, READAHEAD_DEFAULT, RetryConfig};
pub use error::{FsError, Result};
pub use fs::{BucketFs, FileHandle, OpenMode};
pub use memory::MemoryStore;
pub use metadata::ObjectInfo;
pub use multipart::MultipartUpload;
pub use path::{DELIMITER, ObjectPath, PathResolver};
pub use pool::WorkerPool;
pub use read::ReadStream;
pub use retry::{BUILTIN_RETRYABLE_CODES, ErrorClass, RetryPolicy, Verdict};
pub use tree::{DirectoryTree, Listing};
pub use write::WriteStream;

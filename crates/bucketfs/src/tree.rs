// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Pseudo-directories synthesized from flat key listings
//!
//! A directory exists when some key lives under its prefix or when a
//! zero-byte marker object (`dir/`) was written for it. An empty prefix
//! without a marker cannot be told apart from a missing directory.

use crate::client::{ListPage, ObjectStoreClient};
use crate::error::{FsError, Result};
use crate::metadata::ObjectInfo;
use crate::path::{DELIMITER, ObjectPath};
use crate::retry::RetryPolicy;
use diagnostics::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Result of scanning one prefix
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub entries: Vec<ObjectInfo>,
    /// The directory's own marker object was among the keys
    pub marker_seen: bool,
}

impl Listing {
    /// Whether the scan proves the directory exists
    #[must_use]
    pub fn exists(&self) -> bool {
        self.marker_seen || !self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct DirectoryTree {
    client: Arc<dyn ObjectStoreClient>,
    retry: RetryPolicy,
    page_size: Option<usize>,
}

impl DirectoryTree {
    #[must_use]
    pub fn new(client: Arc<dyn ObjectStoreClient>, retry: RetryPolicy, page_size: Option<usize>) -> Self {
        Self {
            client,
            retry,
            page_size,
        }
    }

    /// Entries directly under `dir` (or every key below it when `recursive`).
    ///
    /// Fails with `NotFound` for a non-root directory that has neither
    /// children nor a marker.
    pub async fn list(&self, dir: &ObjectPath, recursive: bool) -> Result<Vec<ObjectInfo>> {
        let listing = self.scan(dir, recursive).await?;
        if !dir.is_bucket_root() && !listing.exists() {
            return Err(FsError::not_found(dir.as_dir()));
        }
        Ok(listing.entries)
    }

    /// Page through the prefix, preserving the store's page order
    pub async fn scan(&self, dir: &ObjectPath, recursive: bool) -> Result<Listing> {
        let dir = dir.as_dir();
        let bucket = dir.bucket();
        let prefix = dir.dir_prefix();
        let delimiter = DELIMITER.to_string();
        let delimiter = (!recursive).then_some(delimiter.as_str());

        let mut listing = Listing::default();
        let mut seen_dirs = HashSet::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .retry
                .call("list", &dir, || {
                    self.client
                        .list(bucket, &prefix, delimiter, token.as_deref(), self.page_size)
                })
                .await?;
            pages += 1;

            let next = page.next_token.clone();
            merge_page(bucket, &prefix, page, &mut listing, &mut seen_dirs);

            match next {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    warn!("store repeated continuation token for {dir}", dir: dir.to_string());
                    break;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(
            "listed {dir}: {count} entries in {pages} pages",
            dir: dir.to_string(),
            count: listing.entries.len(),
            pages: pages
        );
        Ok(listing)
    }

    /// Whether anything other than the directory's own marker lives under it
    pub async fn has_children(&self, dir: &ObjectPath) -> Result<bool> {
        let dir = dir.as_dir();
        let prefix = dir.dir_prefix();
        let page = self
            .retry
            .call("list", &dir, || {
                self.client.list(dir.bucket(), &prefix, None, None, Some(2))
            })
            .await?;
        Ok(page.objects.iter().any(|o| o.key != prefix) || !page.common_prefixes.is_empty())
    }
}

/// Fold one page into the listing. Objects and common prefixes arrive as two
/// sorted lists; they are interleaved by key so the page reads in store order.
fn merge_page(
    bucket: &str,
    prefix: &str,
    page: ListPage,
    listing: &mut Listing,
    seen_dirs: &mut HashSet<String>,
) {
    let mut objects = page.objects.into_iter().peekable();
    let mut prefixes = page.common_prefixes.into_iter().peekable();

    loop {
        let take_object = match (objects.peek(), prefixes.peek()) {
            (Some(o), Some(p)) => o.key <= *p,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        if take_object {
            let Some(meta) = objects.next() else { break };
            if meta.key == prefix {
                listing.marker_seen = true;
                continue;
            }
            let info = ObjectInfo::from_meta(bucket, meta);
            if info.is_directory && !seen_dirs.insert(info.path.key().to_string()) {
                continue;
            }
            listing.entries.push(info);
        } else {
            let Some(common) = prefixes.next() else { break };
            if seen_dirs.insert(common.clone()) {
                let path = ObjectPath::from_parts(bucket, common);
                listing.entries.push(ObjectInfo::directory(&path));
            }
        }
    }
}

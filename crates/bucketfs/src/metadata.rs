// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::client::ObjectMeta;
use crate::path::ObjectPath;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

/// How far the store's clock may trail ours when deciding whether an
/// object was written by a request we sent
pub(crate) const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 60;

/// Whether a store timestamp can belong to a write issued at or after
/// `since`. Stores report whole seconds from their own clock, so the local
/// instant is truncated and widened by the skew allowance. A missing
/// timestamp cannot rule the write out.
pub(crate) fn written_since(last_modified: Option<DateTime<Utc>>, since: DateTime<Utc>) -> bool {
    let floor = since.trunc_subsecs(0) - TimeDelta::seconds(CLOCK_SKEW_ALLOWANCE_SECS);
    last_modified.is_none_or(|t| t >= floor)
}

/// Metadata for a file or pseudo-directory
///
/// Directory entries are synthesized from key prefixes or marker objects and
/// carry no etag or timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: ObjectPath,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

impl ObjectInfo {
    #[must_use]
    pub fn directory(path: &ObjectPath) -> Self {
        Self {
            path: path.as_dir(),
            size: 0,
            etag: None,
            last_modified: None,
            is_directory: true,
        }
    }

    /// Convert raw store metadata. Keys ending in the delimiter are
    /// directory markers.
    pub(crate) fn from_meta(bucket: &str, meta: ObjectMeta) -> Self {
        let path = ObjectPath::from_parts(bucket, meta.key);
        if path.is_dir_intent() {
            return Self::directory(&path);
        }
        Self {
            path,
            size: meta.size,
            etag: meta.etag,
            last_modified: meta.last_modified,
            is_directory: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.path.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_since_tolerates_coarse_clocks() {
        let since = Utc::now();
        assert!(written_since(Some(since.trunc_subsecs(0)), since));
        assert!(written_since(Some(since - TimeDelta::seconds(5)), since));
        assert!(written_since(None, since));
        assert!(!written_since(Some(since - TimeDelta::hours(1)), since));
    }

    #[test]
    fn test_from_meta() {
        let file = ObjectInfo::from_meta(
            "bucket",
            ObjectMeta {
                key: "a/c".to_string(),
                size: 12,
                etag: Some("\"e1\"".to_string()),
                last_modified: None,
            },
        );
        assert!(!file.is_directory);
        assert_eq!(file.size, 12);
        assert_eq!(file.name(), "c");

        let marker = ObjectInfo::from_meta(
            "bucket",
            ObjectMeta {
                key: "a/b/".to_string(),
                size: 0,
                etag: Some("\"d41d8\"".to_string()),
                last_modified: None,
            },
        );
        assert!(marker.is_directory);
        assert_eq!(marker.etag, None);
        assert_eq!(marker.path.to_string(), "bucket/a/b/");
    }
}

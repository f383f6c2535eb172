// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Lexical path handling: filesystem paths to `(bucket, key)` pairs

use crate::error::{FsError, Result};
use std::fmt;

pub const DELIMITER: char = '/';

/// Longest key S3-compatible stores accept, in bytes
pub const MAX_KEY_LEN: usize = 1024;

const MAX_BUCKET_LEN: usize = 255;

/// A resolved location in the store
///
/// The key is empty for the bucket root. A key ending in the delimiter
/// expresses directory intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath {
    bucket: String,
    key: String,
}

impl ObjectPath {
    /// Build a path from parts already known to be normalized (keys from a
    /// listing, for example).
    pub(crate) fn from_parts(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_bucket_root(&self) -> bool {
        self.key.is_empty()
    }

    #[must_use]
    pub fn is_dir_intent(&self) -> bool {
        self.key.ends_with(DELIMITER)
    }

    /// The key without any trailing delimiter
    #[must_use]
    pub fn object_key(&self) -> &str {
        self.key.trim_end_matches(DELIMITER)
    }

    /// Prefix under which this directory's children live (`""` at the root)
    #[must_use]
    pub fn dir_prefix(&self) -> String {
        let key = self.object_key();
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}{DELIMITER}")
        }
    }

    #[must_use]
    pub fn as_dir(&self) -> ObjectPath {
        ObjectPath::from_parts(self.bucket.clone(), self.dir_prefix())
    }

    #[must_use]
    pub fn as_file(&self) -> ObjectPath {
        ObjectPath::from_parts(self.bucket.clone(), self.object_key())
    }

    /// Final segment of the key, or the bucket name at the root
    #[must_use]
    pub fn name(&self) -> &str {
        let key = self.object_key();
        if key.is_empty() {
            return &self.bucket;
        }
        key.rsplit(DELIMITER).next().unwrap_or(key)
    }

    /// Parent directory, in directory form. `None` at the bucket root.
    #[must_use]
    pub fn parent(&self) -> Option<ObjectPath> {
        let key = self.object_key();
        if key.is_empty() {
            return None;
        }
        let parent_key = match key.rfind(DELIMITER) {
            Some(idx) => &key[..=idx],
            None => "",
        };
        Some(ObjectPath::from_parts(self.bucket.clone(), parent_key))
    }

    /// Every enclosing directory, nearest first, ending with the bucket root
    pub fn ancestors(&self) -> impl Iterator<Item = ObjectPath> {
        std::iter::successors(self.parent(), ObjectPath::parent)
    }

    /// Identity used for cache lookups: directory intent does not matter
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}{DELIMITER}{}", self.bucket, self.object_key())
    }

    /// Whether `other` lives at or below this directory
    #[must_use]
    pub fn contains(&self, other: &ObjectPath) -> bool {
        self.bucket == other.bucket && other.key.starts_with(&self.dir_prefix())
    }

    /// Re-root `other` (which must live under `self`) beneath `target`
    #[must_use]
    pub(crate) fn rebase(&self, other: &ObjectPath, target: &ObjectPath) -> Option<ObjectPath> {
        if !self.contains(other) {
            return None;
        }
        let suffix = &other.key[self.dir_prefix().len()..];
        Some(ObjectPath::from_parts(
            target.bucket.clone(),
            format!("{}{}", target.dir_prefix(), suffix),
        ))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}{DELIMITER}{}", self.bucket, self.key)
        }
    }
}

/// Parses and validates filesystem paths
///
/// Resolution is purely lexical: repeated delimiters collapse, `.` segments
/// vanish and `..` pops the previous segment. Popping past the filesystem
/// root is an error. No remote call is ever made.
#[derive(Debug, Clone)]
pub struct PathResolver {
    protocols: Vec<String>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(["s3", "s3a"])
    }
}

impl PathResolver {
    /// Create a resolver that strips `<protocol>://` for each given protocol
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
        }
    }

    fn strip_protocol<'a>(&self, path: &'a str) -> Result<&'a str> {
        if let Some((scheme, rest)) = path.split_once("://") {
            if self.protocols.iter().any(|p| p == scheme) {
                return Ok(rest);
            }
            return Err(FsError::invalid_path(
                path,
                format!("unsupported protocol {scheme:?}"),
            ));
        }
        Ok(path)
    }

    pub fn resolve(&self, path: &str) -> Result<ObjectPath> {
        let stripped = self.strip_protocol(path)?;

        if let Some(bad) = stripped.chars().find(|c| c.is_control()) {
            return Err(FsError::invalid_path(
                path,
                format!("disallowed character {bad:?}"),
            ));
        }

        let mut segments: Vec<&str> = Vec::new();
        let mut dir_intent = stripped.ends_with(DELIMITER);
        for segment in stripped.split(DELIMITER) {
            match segment {
                "" => {}
                "." => dir_intent = true,
                ".." => {
                    if segments.pop().is_none() {
                        return Err(FsError::invalid_path(path, "escapes the filesystem root"));
                    }
                    dir_intent = true;
                }
                s => {
                    segments.push(s);
                    dir_intent = false;
                }
            }
        }
        // a trailing delimiter after the last real segment still counts
        dir_intent = dir_intent || stripped.ends_with(DELIMITER);

        let Some((bucket, rest)) = segments.split_first() else {
            return Err(FsError::invalid_path(path, "empty bucket"));
        };
        validate_bucket(path, bucket)?;

        let mut key = rest.join("/");
        if dir_intent && !key.is_empty() {
            key.push(DELIMITER);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(FsError::invalid_path(
                path,
                format!("key longer than {MAX_KEY_LEN} bytes"),
            ));
        }

        Ok(ObjectPath::from_parts(*bucket, key))
    }

    /// Resolve and force directory form
    pub fn resolve_dir(&self, path: &str) -> Result<ObjectPath> {
        Ok(self.resolve(path)?.as_dir())
    }
}

fn validate_bucket(path: &str, bucket: &str) -> Result<()> {
    if bucket.len() > MAX_BUCKET_LEN {
        return Err(FsError::invalid_path(path, "bucket name too long"));
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        return Err(FsError::invalid_path(
            path,
            format!("invalid bucket name {bucket:?}"),
        ));
    }
    Ok(())
}

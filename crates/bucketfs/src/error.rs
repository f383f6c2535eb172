// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for filesystem operations

use crate::client::ClientError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Permission denied for {path}: {source}")]
    PermissionDenied { path: String, source: ClientError },

    #[error("Conflict on {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("{op} on {path} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        op: &'static str,
        path: String,
        attempts: u32,
        source: ClientError,
    },

    #[error("Stream is closed: {0}")]
    ClosedStream(String),

    #[error(
        "Multipart upload {upload_id} for {path} failed with {parts_completed} parts acknowledged (remote abort succeeded: {abort_succeeded}): {source}"
    )]
    PartialUpload {
        path: String,
        upload_id: String,
        parts_completed: usize,
        abort_succeeded: bool,
        abort_error: Option<String>,
        source: Box<FsError>,
    },

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid seek to {offset} in {path}")]
    InvalidSeek { path: String, offset: i64 },

    #[error("Move of {src} to {dst} left both copies in place: {source}")]
    PartialMove {
        src: String,
        dst: String,
        source: Box<FsError>,
    },

    #[error("{op} on {path} failed: {source}")]
    Store {
        op: &'static str,
        path: String,
        source: ClientError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FsError {
    pub fn invalid_path<P: AsRef<str>, R: Into<String>>(path: P, reason: R) -> Self {
        FsError::InvalidPath {
            path: path.as_ref().to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found<P: ToString>(path: P) -> Self {
        FsError::NotFound(path.to_string())
    }

    pub fn conflict<P: ToString, R: Into<String>>(path: P, reason: R) -> Self {
        FsError::Conflict {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn closed_stream<P: ToString>(path: P) -> Self {
        FsError::ClosedStream(path.to_string())
    }

    pub fn already_exists<P: ToString>(path: P) -> Self {
        FsError::AlreadyExists(path.to_string())
    }

    pub fn not_a_directory<P: ToString>(path: P) -> Self {
        FsError::NotADirectory(path.to_string())
    }

    pub fn directory_not_empty<P: ToString>(path: P) -> Self {
        FsError::DirectoryNotEmpty(path.to_string())
    }

    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        FsError::Configuration(reason.into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, FsError::Conflict { .. })
    }
}

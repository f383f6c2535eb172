// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-filesystem configuration
//!
//! Values arrive from whatever loader the embedding application uses; this
//! module only supplies defaults and range checks.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIB: usize = 1024 * 1024;

/// Default part size for multipart uploads, also the smallest part S3 accepts
pub const PART_SIZE_DEFAULT: usize = 5 * MIB;

/// Default readahead window for read streams
pub const READAHEAD_DEFAULT: usize = 5 * MIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub factor: f32,
    pub max_delay: Duration,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
    pub jitter: bool,
    /// Store error codes treated as transient in addition to the built-in set
    pub extra_retryable_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            factor: 1.7,
            max_delay: Duration::from_secs(15),
            max_elapsed: Duration::from_secs(60),
            jitter: true,
            extra_retryable_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Lifetime of cached metadata and listings; zero disables caching
    pub cache_ttl: Duration,
    /// Coalesce concurrent metadata fetches for the same path
    pub single_flight: bool,
    pub part_size: usize,
    pub max_part_concurrency: usize,
    /// Concurrent remote calls for bulk work (recursive delete/move, prefetch)
    pub worker_pool_size: usize,
    /// Extra bytes fetched past each read; zero fetches exactly what is asked
    pub readahead: usize,
    /// Fetch the next readahead window in the background
    pub prefetch: bool,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Page size hint for LIST calls; `None` leaves it to the store
    pub list_page_size: Option<usize>,
    /// URL schemes stripped from incoming paths
    pub protocols: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            single_flight: true,
            part_size: PART_SIZE_DEFAULT,
            max_part_concurrency: 4,
            worker_pool_size: 8,
            readahead: READAHEAD_DEFAULT,
            prefetch: false,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            list_page_size: None,
            protocols: vec!["s3".to_string(), "s3a".to_string()],
        }
    }
}

impl FsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(FsError::configuration("part_size must be positive"));
        }
        if self.max_part_concurrency == 0 {
            return Err(FsError::configuration(
                "max_part_concurrency must be positive",
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(FsError::configuration("worker_pool_size must be positive"));
        }
        if self.request_timeout.is_zero() {
            return Err(FsError::configuration("request_timeout must be positive"));
        }
        if self.list_page_size == Some(0) {
            return Err(FsError::configuration("list_page_size must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(FsError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.factor.is_nan() || self.retry.factor < 1.0 {
            return Err(FsError::configuration("retry.factor must be >= 1.0"));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(FsError::configuration(
                "retry.min_delay must not exceed retry.max_delay",
            ));
        }
        Ok(())
    }

    /// Caching disabled entirely
    #[must_use]
    pub fn cache_disabled(&self) -> bool {
        self.cache_ttl.is_zero()
    }
}

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Classification and retry of remote calls
//!
//! Every call into an [`ObjectStoreClient`](crate::client::ObjectStoreClient)
//! goes through a [`RetryPolicy`]. Failures are classified, transient ones are
//! retried with exponential backoff plus jitter, and everything else is
//! converted into the matching [`FsError`].
//!
//! Idempotent calls use [`RetryPolicy::call`]. Calls that may already have
//! taken effect remotely when they report a failure (multipart completion,
//! conditional puts) use [`RetryPolicy::call_guarded`], which re-queries
//! remote state before every retry.

use crate::client::{ClientError, ClientErrorKind, ClientResult};
use crate::config::RetryConfig;
use crate::error::{FsError, Result};
use crate::path::ObjectPath;
use backon::{BackoffBuilder, ExponentialBuilder};
use diagnostics::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Store error codes that always mean "try again later"
pub const BUILTIN_RETRYABLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NotFound,
    PermissionDenied,
    Conflict,
    Fatal,
}

/// Outcome of re-checking remote state after an ambiguous failure
#[derive(Debug)]
pub enum Verdict<T> {
    /// The earlier attempt took effect; use this value as the result
    Done(T),
    /// Nothing happened remotely; safe to send the request again
    Retry,
    /// Remote state belongs to someone else
    Conflict(String),
}

type Classifier = Arc<dyn Fn(&ClientError) -> Option<ErrorClass> + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    timeout: Duration,
    classifier: Option<Classifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            classifier: None,
        }
    }

    /// Consult `classifier` before the built-in rules. Returning `None` falls
    /// through to the built-in classification.
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ClientError) -> Option<ErrorClass> + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn classify(&self, err: &ClientError) -> ErrorClass {
        if let Some(class) = self.classifier.as_ref().and_then(|c| c(err)) {
            return class;
        }
        if let Some(code) = err.code.as_deref() {
            if BUILTIN_RETRYABLE_CODES.contains(&code)
                || self.config.extra_retryable_codes.iter().any(|c| c == code)
            {
                return ErrorClass::Retryable;
            }
        }
        match err.kind {
            ClientErrorKind::Throttled | ClientErrorKind::Timeout | ClientErrorKind::Network => {
                ErrorClass::Retryable
            }
            ClientErrorKind::Server(status) if status >= 500 => ErrorClass::Retryable,
            ClientErrorKind::NotFound => ErrorClass::NotFound,
            ClientErrorKind::AccessDenied => ErrorClass::PermissionDenied,
            ClientErrorKind::PreconditionFailed => ErrorClass::Conflict,
            ClientErrorKind::Server(_)
            | ClientErrorKind::InvalidRequest
            | ClientErrorKind::Unsupported
            | ClientErrorKind::Other => ErrorClass::Fatal,
        }
    }

    /// Delay schedule: `min(min_delay * factor^i, max_delay)`, optionally jittered
    fn backoff(&self) -> ExponentialBuilder {
        let retries = self.config.max_attempts.saturating_sub(1) as usize;
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.config.min_delay)
            .with_max_delay(self.config.max_delay)
            .with_factor(self.config.factor)
            .with_max_times(retries);
        if self.config.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run one request under the per-call timeout. Exceeding it is reported
    /// as a transient timeout.
    async fn timed<T, Fut>(&self, fut: Fut) -> ClientResult<T>
    where
        Fut: Future<Output = ClientResult<T>>,
    {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Retry an idempotent call until it succeeds, fails permanently, or the
    /// attempt/elapsed-time budget runs out.
    pub async fn call<T, F, Fut>(&self, op: &'static str, path: &ObjectPath, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let start = Instant::now();
        let mut backoff = self.backoff().build();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match self.timed(f()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if self.classify(&err) != ErrorClass::Retryable {
                return Err(self.to_fs_error(op, path, err, attempts));
            }
            match self.next_delay(&mut backoff, start) {
                Some(delay) => {
                    warn!(
                        "retrying {op} on {path} in {delay_ms}ms: {reason}",
                        op: op,
                        path: path.to_string(),
                        delay_ms: delay.as_millis() as u64,
                        reason: err.to_string()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(self.to_fs_error(op, path, err, attempts)),
            }
        }
    }

    /// The next backoff delay, unless sleeping it would overrun `max_elapsed`
    fn next_delay(&self, backoff: &mut impl Iterator<Item = Duration>, start: Instant) -> Option<Duration> {
        backoff
            .next()
            .filter(|delay| start.elapsed() + *delay <= self.config.max_elapsed)
    }

    /// Retry a call that must not be blindly repeated.
    ///
    /// After any failure that may have been applied remotely, `verify` is
    /// asked what actually happened before deciding to resend. A permanent
    /// failure seen after an ambiguous attempt is also checked against
    /// `verify`, since it may be the echo of our own earlier success.
    pub async fn call_guarded<T, F, Fut, V, VFut>(
        &self,
        op: &'static str,
        path: &ObjectPath,
        mut f: F,
        mut verify: V,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
        V: FnMut() -> VFut,
        VFut: Future<Output = Result<Verdict<T>>>,
    {
        let start = Instant::now();
        let mut backoff = self.backoff().build();
        let mut attempts = 0u32;
        let mut ambiguous = false;

        loop {
            attempts += 1;
            let err = match self.timed(f()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = self.classify(&err);
            if class != ErrorClass::Retryable {
                if ambiguous {
                    if let Verdict::Done(value) = verify().await? {
                        debug!(
                            "{op} on {path} had already succeeded",
                            op: op,
                            path: path.to_string()
                        );
                        return Ok(value);
                    }
                }
                return Err(self.to_fs_error(op, path, err, attempts));
            }

            // Throttling is a rejection; anything else may have been applied.
            if err.kind != ClientErrorKind::Throttled {
                ambiguous = true;
                match verify().await? {
                    Verdict::Done(value) => {
                        debug!(
                            "{op} on {path} succeeded despite {reason}",
                            op: op,
                            path: path.to_string(),
                            reason: err.to_string()
                        );
                        return Ok(value);
                    }
                    Verdict::Conflict(reason) => return Err(FsError::conflict(path, reason)),
                    Verdict::Retry => {}
                }
            }

            match self.next_delay(&mut backoff, start) {
                Some(delay) => {
                    warn!(
                        "retrying {op} on {path} in {delay_ms}ms: {reason}",
                        op: op,
                        path: path.to_string(),
                        delay_ms: delay.as_millis() as u64,
                        reason: err.to_string()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(self.to_fs_error(op, path, err, attempts)),
            }
        }
    }

    /// Convert a failure that was not (or no longer) retried
    #[must_use]
    pub fn to_fs_error(
        &self,
        op: &'static str,
        path: &ObjectPath,
        err: ClientError,
        attempts: u32,
    ) -> FsError {
        match self.classify(&err) {
            ErrorClass::Retryable => FsError::RetryExhausted {
                op,
                path: path.to_string(),
                attempts,
                source: err,
            },
            ErrorClass::NotFound => FsError::not_found(path),
            ErrorClass::PermissionDenied => FsError::PermissionDenied {
                path: path.to_string(),
                source: err,
            },
            ErrorClass::Conflict => FsError::conflict(path, err.to_string()),
            ErrorClass::Fatal => FsError::Store {
                op,
                path: path.to_string(),
                source: err,
            },
        }
    }
}

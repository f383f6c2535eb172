// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging setup shared by the bucketfs crates
//!
//! Usage:
//! - Set BUCKETFS_LOG=off (default) - no logs
//! - Set BUCKETFS_LOG=info - multipart sessions, moves, bulk deletes
//! - Set BUCKETFS_LOG=warn - retries and best-effort cleanup failures
//! - Set BUCKETFS_LOG=debug - cache hits/misses, range requests, list pages

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init_diagnostics`]
pub const LOG_ENV_VAR: &str = "BUCKETFS_LOG";

static INIT: Once = Once::new();

/// Map a `BUCKETFS_LOG` value to a minimum level.
///
/// `Ok(None)` means logging stays off. Unknown values are returned as `Err`
/// so the caller can fall back to `info`.
pub fn parse_level(value: &str) -> Result<Option<emit::Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" | "none" => Ok(None),
        "debug" => Ok(Some(emit::Level::Debug)),
        "info" => Ok(Some(emit::Level::Info)),
        "warn" | "warning" => Ok(Some(emit::Level::Warn)),
        "error" => Ok(Some(emit::Level::Error)),
        other => Err(other.to_string()),
    }
}

/// Initialize diagnostics based on the BUCKETFS_LOG environment variable
///
/// Safe to call more than once; only the first call installs an emitter.
pub fn init_diagnostics() {
    let value = std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| "off".to_string());
    match parse_level(&value) {
        Ok(level) => init_with_level(level),
        Err(unknown) => {
            init_with_level(Some(emit::Level::Info));
            emit::warn!(
                "unknown {var} value {unknown}, using info",
                var: LOG_ENV_VAR,
                unknown: unknown
            );
        }
    }
}

/// Install a stderr emitter filtering below `level`. `None` leaves logging off.
pub fn init_with_level(level: Option<emit::Level>) {
    INIT.call_once(|| {
        let Some(level) = level else {
            return;
        };
        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The emitter lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log operations a user may want to see in normal usage
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (cache decisions, range requests, list pages)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions (retries, fallbacks)
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that are surfaced or swallowed as best-effort cleanup
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("off"), Ok(None));
        assert_eq!(parse_level(""), Ok(None));
        assert_eq!(parse_level("DEBUG"), Ok(Some(emit::Level::Debug)));
        assert_eq!(parse_level(" warn "), Ok(Some(emit::Level::Warn)));
        assert_eq!(parse_level("loud"), Err("loud".to_string()));
    }

    #[test]
    fn test_init_is_safe_to_call_multiple_times() {
        init_diagnostics();
        init_diagnostics();
        init_with_level(None);
    }

    #[test]
    fn test_macros_compile() {
        log_info!("Test message");
        log_debug!("Debug message with {value}", value: 42);
        warn!("Retrying {op}", op: "head");
        error!("Abort failed for {upload_id}", upload_id: "u-1");
    }
}

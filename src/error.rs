//! Application-wide error types.
//!
//! This module provides a unified error hierarchy for the application.
//! The engine returns these typed errors via `thiserror`, while CLI/main
//! uses `anyhow` for convenient error propagation and presentation.
//!
//! # Design
//!
//! - [`Error`]: Top-level application error enum
//! - [`Error::Cancelled`] is a sentinel, not a failure: it unwinds the
//!   engine stack and the coordinator exits 0
//! - All errors implement `std::error::Error` for compatibility

use std::path::PathBuf;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level application error.
///
/// Aggregates errors from all subsystems for unified handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-2xx response from the service
    #[error("Service error (HTTP {status}): {body_excerpt}")]
    Service { status: u16, body_excerpt: String },

    /// Network-level failure talking to the service
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Could not acquire the catalog cache lock within the retry budget
    #[error("Timed out waiting for the catalog cache lock at {0}")]
    LockTimeout(PathBuf),

    /// A cache artifact failed to parse; treated as absent by callers
    #[error("Corrupt cache artifact {path}: {message}")]
    CacheCorruption { path: PathBuf, message: String },

    /// ffmpeg or rclone is not installed / not runnable
    #[error("{tool} not found: install it or disable the feature that needs it")]
    ToolMissing { tool: &'static str },

    /// A subprocess exited non-zero
    #[error("{tool} failed (exit {exit}): {stderr_excerpt}")]
    ToolFailure {
        tool: &'static str,
        exit: i32,
        stderr_excerpt: String,
    },

    /// HLS key/IV malformed or PKCS#5 padding invalid
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// No candidate quality could be resolved for a track
    #[error("No stream format available for track {track_id}")]
    FormatUnavailable { track_id: u64 },

    /// Cooperative cancellation observed at a wait-point.
    /// Not an error to the user; the coordinator finalizes and exits 0.
    #[error("cancelled")]
    Cancelled,

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a service error from an HTTP status and response body.
    /// The body is truncated so log lines stay readable.
    pub fn service(status: u16, body: &str) -> Self {
        let body_excerpt = if body.len() > 256 {
            let mut end = 256;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &body[..end])
        } else {
            body.to_string()
        };
        Self::Service {
            status,
            body_excerpt,
        }
    }

    /// Create a cache corruption error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CacheCorruption {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a decrypt error.
    pub fn decrypt(message: impl Into<String>) -> Self {
        Self::Decrypt(message.into())
    }

    /// Create a tool failure error keeping the last non-empty stderr line.
    pub fn tool_failure(tool: &'static str, exit: i32, stderr: &str) -> Self {
        let stderr_excerpt = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        Self::ToolFailure {
            tool,
            exit,
            stderr_excerpt,
        }
    }

    /// True if this is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True if the error is plausibly transient (network / service hiccup).
    /// The artist-metadata cache uses this to decide stale fallback.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service { .. } | Self::Transport(_))
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_truncates_body() {
        let body = "x".repeat(1000);
        let err = Error::service(500, &body);
        match err {
            Error::Service {
                status,
                body_excerpt,
            } => {
                assert_eq!(status, 500);
                assert!(body_excerpt.chars().count() <= 257);
                assert!(body_excerpt.ends_with('…'));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_service_error_truncates_on_char_boundary() {
        // Multibyte characters straddling the cut must not panic
        let body = "é".repeat(300);
        let err = Error::service(502, &body);
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_cancelled_is_sentinel() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::config("x").is_cancelled());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::service(503, "unavailable").is_transient());
        assert!(!Error::config("bad").is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_tool_failure_takes_last_nonempty_stderr_line() {
        let err = Error::tool_failure("ffmpeg", 1, "line one\nreal error here\n\n");
        assert!(err.to_string().contains("real error here"));
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::decrypt("bad padding").context("while fetching segment");
        let msg = err.to_string();
        assert!(msg.contains("while fetching segment"));
        assert!(msg.contains("bad padding"));
    }
}

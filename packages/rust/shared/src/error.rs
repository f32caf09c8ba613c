//! Error types for CourseWatch.
//!
//! Library crates use [`CourseWatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all CourseWatch operations.
#[derive(Debug, thiserror::Error)]
pub enum CourseWatchError {
    /// Configuration loading or validation error. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Login was rejected or an interactive challenge blocked it.
    #[error("authentication error: {message}")]
    Authentication { message: String },

    /// The content listing could not be located or read.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// The notification sink refused or failed to accept an alert.
    #[error("notification error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Notification {
        status: Option<u16>,
        message: String,
    },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Browser automation failure (protocol error, missing element, closed session).
    #[error("driver error: {0}")]
    Driver(String),

    /// A bounded wait ran out.
    #[error("timed out after {}ms waiting for {operation}", after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CourseWatchError>;

impl CourseWatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an authentication error from any displayable message.
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
        }
    }

    /// Create an extraction error from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a notification error, optionally carrying the sink's HTTP status.
    pub fn notification(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Notification {
            status,
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable category label used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "configuration",
            Self::Authentication { .. } => "authentication",
            Self::Extraction { .. } => "extraction",
            Self::Notification { .. } => "notification",
            Self::Storage(_) => "storage",
            Self::Driver(_) => "driver",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io",
        }
    }

    /// Whether this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

//! Error types for the CENO core.
//!
//! Backend-level failures are recovered locally by the multiplexers and the
//! dispatcher; only the exhaustion conditions of each component surface here.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::StageDiagnostic;

/// Why a single backend (or source) failed its part of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    /// Backend or source identifier.
    pub source: String,
    /// Human-readable failure reason.
    pub reason: String,
}

impl SourceFailure {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

/// Render a failure list as `a: x; b: y`.
pub(crate) fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for the CENO core.
#[derive(Debug, Error)]
pub enum CenoError {
    // Request resolution errors
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Network filtering detected for {url}: {reason}")]
    NetworkFiltering { url: String, reason: String },

    #[error("Connection to {name} blocked on every backend: {}", join_failures(.failures))]
    ConnectionBlocked {
        name: String,
        failures: Vec<SourceFailure>,
    },

    #[error("Cache miss for {url}: {}", join_failures(.failures))]
    CacheMiss {
        url: String,
        failures: Vec<SourceFailure>,
    },

    #[error("All stages failed for {url} ({} diagnostics)", .diagnostics.len())]
    AggregatedFailure {
        url: String,
        diagnostics: Vec<StageDiagnostic>,
    },

    // Resource accounting errors
    #[error("Disk budget exceeded: need {needed} bytes, {available} available")]
    DiskBudgetExceeded { needed: u64, available: u64 },

    #[error("{kind} budget exceeded: requested {requested}, {available} available")]
    ResourceBudgetExceeded {
        kind: String,
        requested: u64,
        available: u64,
    },

    #[error("Resource scheduler has shut down")]
    SchedulerShutdown,

    // Fan-out errors
    #[error("No backend accepted seeding {url}: {}", join_failures(.failures))]
    SeedRejected {
        url: String,
        failures: Vec<SourceFailure>,
    },

    #[error("No backend can host {name}: {}", join_failures(.failures))]
    HostUnavailable {
        name: String,
        failures: Vec<SourceFailure>,
    },

    // Transport errors
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for CENO operations.
pub type Result<T> = std::result::Result<T, CenoError>;

impl From<std::io::Error> for CenoError {
    fn from(err: std::io::Error) -> Self {
        CenoError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CenoError {
    fn from(err: serde_json::Error) -> Self {
        CenoError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for CenoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CenoError::Timeout(Duration::from_secs(0))
        } else {
            CenoError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl CenoError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CenoError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        CenoError::Protocol {
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry of the same operation.
    ///
    /// Filtering is never retryable: retrying a censored origin only
    /// delays the fall-through to the injector.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CenoError::Network { .. } | CenoError::Timeout(_))
    }

    /// Check if this error reports network filtering.
    pub fn is_filtering(&self) -> bool {
        matches!(self, CenoError::NetworkFiltering { .. })
    }

    /// Per-backend failures carried by aggregate errors, if any.
    pub fn source_failures(&self) -> &[SourceFailure] {
        match self {
            CenoError::ConnectionBlocked { failures, .. }
            | CenoError::CacheMiss { failures, .. }
            | CenoError::SeedRejected { failures, .. }
            | CenoError::HostUnavailable { failures, .. } => failures,
            _ => &[],
        }
    }
}

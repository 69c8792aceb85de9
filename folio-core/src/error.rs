/*!
Error types for the Folio core engine.
*/

use folio_retry::RetryableError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type used throughout the Folio core.
pub type Result<T> = std::result::Result<T, FolioError>;

/// Coarse classification of a storage backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Timeouts, dropped connections, throttling and 5xx responses
    Transient,
    /// Credentials rejected or missing permissions
    PermissionDenied,
    /// Malformed request, bad bucket name and similar caller mistakes
    InvalidRequest,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendErrorKind::Transient => "transient",
            BackendErrorKind::PermissionDenied => "permission denied",
            BackendErrorKind::InvalidRequest => "invalid request",
            BackendErrorKind::Other => "backend error",
        };
        f.write_str(label)
    }
}

/// One backend's share of a replicated operation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

impl BackendFailure {
    pub fn new(backend: impl Into<String>, error: &FolioError) -> Self {
        Self {
            backend: backend.into(),
            reason: error.to_string(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while capturing, storing or diffing snapshots.
#[derive(Error, Debug)]
pub enum FolioError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid snapshot format
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// Rejected input: malformed trigger, bad configuration values
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested object does not exist
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// A single storage backend failed
    #[error("Storage error on {backend} ({kind}): {message}")]
    Backend {
        backend: String,
        kind: BackendErrorKind,
        message: String,
    },

    /// The backend does not implement an optional capability
    #[error("Backend {backend} does not support {capability}")]
    Unsupported {
        backend: String,
        capability: &'static str,
    },

    /// Every backend failed a replicated operation
    #[error("{operation} failed on all {} backends: {}", .failures.len(), join_failures(.failures))]
    AllBackendsFailed {
        operation: &'static str,
        failures: Vec<BackendFailure>,
    },

    /// Read failed on the primary and on every mirror
    #[error("Read failed on primary ({source}); mirror failures: [{}]", join_failures(.mirrors))]
    ReadFailed {
        #[source]
        source: Box<FolioError>,
        mirrors: Vec<BackendFailure>,
    },

    /// The external workspace API rejected or failed a request
    #[error("Workspace API error (status {}): {message}", .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()))]
    Api {
        status: Option<u16>,
        message: String,
        transient: bool,
    },

    /// The cycle deadline passed before the operation could run
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The similarity provider failed to return vectors
    #[error("Similarity provider error: {0}")]
    Similarity(String),
}

impl FolioError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new not-found error for a storage path
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a new backend error
    pub fn backend<B: Into<String>, S: Into<String>>(backend: B, kind: BackendErrorKind, msg: S) -> Self {
        Self::Backend {
            backend: backend.into(),
            kind,
            message: msg.into(),
        }
    }

    /// Create a new unsupported-capability error
    pub fn unsupported<B: Into<String>>(backend: B, capability: &'static str) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            capability,
        }
    }

    /// True when the error means "the object is absent" rather than "the call failed"
    pub fn is_not_found(&self) -> bool {
        matches!(self, FolioError::NotFound { .. })
    }

    /// True for timeouts, connection failures, throttling and server-side errors
    pub fn is_transient(&self) -> bool {
        match self {
            FolioError::Io(err) => err.is_transient(),
            FolioError::Backend { kind, .. } => *kind == BackendErrorKind::Transient,
            FolioError::Api { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl RetryableError for FolioError {
    fn is_transient(&self) -> bool {
        FolioError::is_transient(self)
    }
}

impl From<reqwest::Error> for FolioError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let transient = err.is_timeout()
            || err.is_connect()
            || status.map(is_transient_status).unwrap_or(false);
        FolioError::Api {
            status,
            message: err.to_string(),
            transient,
        }
    }
}

/// HTTP statuses that indicate a retryable condition
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

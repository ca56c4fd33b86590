//! Source Error Types
//!
//! Typed failures surfaced to callers of the cached source layer.
//! Maps HTTP status codes and OAuth outcomes to specific error variants so the
//! host application can decide how (and whether) to report them.

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SourceError>;

/// Cached source error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Timed out waiting for the user's authorization")]
    AuthTimeout,

    #[error("Authorization cancelled")]
    AuthCancelled,

    #[error("Authorization state mismatch, possible cross-site request forgery blocked")]
    AuthSecurityMismatch,

    #[error("Authorization rejected by provider: {0}")]
    AuthRejected(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid name: '{0}'")]
    InvalidName(String),

    #[error("Name in use: {name} in '{path}'")]
    NameInUse { path: String, name: String },

    #[error("{operation} failed ({status}): {body}")]
    Network {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

impl SourceError {
    /// Create a Network error from an HTTP status code and response body
    pub fn from_status(operation: &str, status: u16, body: &str) -> Self {
        SourceError::Network {
            operation: operation.to_string(),
            status,
            body: body.to_string(),
        }
    }

    /// Whether this outcome is an expected user action rather than a failure.
    ///
    /// A closed popup is the user's choice and should not be reported as an
    /// application error.
    pub fn is_expected(&self) -> bool {
        matches!(self, SourceError::AuthCancelled)
    }

    /// Whether this error must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::AuthSecurityMismatch)
    }

    /// Whether the backend rejected our access token
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SourceError::Network { status: 401, .. })
    }

    /// Whether the failure was raised before any network call was attempted
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SourceError::PathNotFound(_)
                | SourceError::NameInUse { .. }
                | SourceError::InvalidName(_)
        )
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::InvalidResponse(err.to_string())
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::InvalidResponse(err.to_string())
    }
}

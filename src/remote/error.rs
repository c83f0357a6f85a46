//! Typed failures of remote storage calls.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::auth::{ClientError, CredentialError};
use crate::retry::FailureType;

/// Errors returned by a [`super::RemoteStore`].
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The resource does not exist (or is not visible to this account).
    #[error("remote resource not found: {resource_id}")]
    NotFound {
        /// Id that was requested
        resource_id: String,
    },

    /// The account lacks access; retrying will not help.
    #[error("permission denied on {resource_id}: {message}")]
    PermissionDenied {
        /// Id that was requested
        resource_id: String,
        /// Server-provided reason
        message: String,
    },

    /// Rate limit or download quota hit.
    #[error("quota exceeded on {resource_id}: {message}")]
    QuotaExceeded {
        /// Id that was requested
        resource_id: String,
        /// Server-provided reason
        message: String,
        /// Server-mandated wait, if any
        retry_after: Option<Duration>,
    },

    /// Any other non-success status.
    #[error("HTTP {status} from {operation}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Which store operation failed
        operation: &'static str,
        /// Server-provided message
        message: String,
    },

    /// Transport failure.
    #[error("network error during {operation}: {source}")]
    Network {
        /// Which store operation failed
        operation: &'static str,
        /// Underlying error
        #[source]
        source: reqwest::Error,
    },

    /// Local file read/write failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// File being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Response body did not have the expected shape.
    #[error("unexpected response from {operation}: {message}")]
    Decode {
        /// Which store operation failed
        operation: &'static str,
        /// What was wrong
        message: String,
    },

    /// Could not obtain a usable token.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl RemoteError {
    /// Creates a network error for `operation`.
    #[must_use]
    pub fn network(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Network { operation, source }
    }

    /// Creates an IO error for `path`.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a decode error for `operation`.
    #[must_use]
    pub fn decode(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation,
            message: message.into(),
        }
    }

    /// Whether the resource should be treated as already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Server-mandated wait before retrying, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Maps into a retry classification.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::QuotaExceeded { .. } => FailureType::RateLimited,
            Self::Network { .. } => FailureType::Transient,
            Self::Http { status, .. } if *status >= 500 || *status == 408 => FailureType::Transient,
            Self::NotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Http { .. }
            | Self::Io { .. }
            | Self::Decode { .. }
            | Self::Credentials(_) => FailureType::Permanent,
        }
    }

    pub(crate) fn from_client(operation: &'static str, err: ClientError) -> Self {
        match err {
            ClientError::Credentials(e) => Self::Credentials(e),
            ClientError::Network(source) => Self::Network { operation, source },
        }
    }
}

//! Pipeline error taxonomy.
//!
//! Component errors are flattened into the handful of cases a caller acts
//! on. Everything here reaches the caller of a single-resource call; inside
//! a folder walk each child's error is recorded in the report instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::auth::{CredentialError, Role, StorageError};
use crate::browser::BrowserError;
use crate::guard::GuardError;
use crate::ledger::LedgerError;
use crate::locator::LocatorError;
use crate::raster::RasterError;
use crate::remote::RemoteError;
use crate::video::VideoError;

/// Why processing a resource failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input text did not resolve to a resource. Not retried.
    #[error(transparent)]
    UnresolvableReference(#[from] LocatorError),

    /// No stored credentials for the role.
    #[error("no credentials stored for the {role} role")]
    CredentialsUnavailable { role: Role },

    /// The token endpoint rejected a refresh.
    #[error("credential refresh for the {role} role failed: {reason}")]
    CredentialsRefreshFailed { role: Role, reason: String },

    /// Persisted credentials could not be read or written.
    #[error("credential storage failed: {0}")]
    CredentialStorage(#[source] StorageError),

    #[error("remote resource not found: {resource_id}")]
    RemoteNotFound { resource_id: String },

    /// Not retried; retrying cannot fix an ACL problem.
    #[error("permission denied on {resource_id}: {message}")]
    RemotePermissionDenied { resource_id: String, message: String },

    /// Still over quota after bounded retries.
    #[error("quota exceeded on {resource_id}: {message}")]
    RemoteQuotaExceeded { resource_id: String, message: String },

    /// No PDF renderer on this machine.
    #[error("rendering tool unavailable (searched: {})", searched.join(", "))]
    RenderingToolUnavailable { searched: Vec<String> },

    /// One page failed, so the document was abandoned.
    #[error("page {} failed: {cause}", page_index + 1)]
    PageProcessingFailed { page_index: usize, cause: String },

    #[error("no stream URL observed for {resource_id} within {waited:?}")]
    StreamUrlTimeout { resource_id: String, waited: Duration },

    #[error("download of {resource_id} failed after {attempts} attempts: {last_cause}")]
    DownloadExhausted {
        resource_id: String,
        attempts: u32,
        last_cause: String,
    },

    /// A folder operation was given something else.
    #[error("{resource_id} is not a folder (MIME type {mime_type})")]
    NotAFolder { resource_id: String, mime_type: String },

    /// Folder nesting exceeded the configured depth.
    #[error("folder {resource_id} is nested deeper than {max_depth} levels")]
    DepthExceeded { resource_id: String, max_depth: usize },

    /// Other remote failure (HTTP, network, decode).
    #[error(transparent)]
    Remote(RemoteError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    /// Other raster failure (renderer exit, image codec, reassembly).
    #[error(transparent)]
    Raster(RasterError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Creates an IO error for `path`.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable label for the failure category.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnresolvableReference(_) => "unresolvable_reference",
            Self::CredentialsUnavailable { .. } => "credentials_unavailable",
            Self::CredentialsRefreshFailed { .. } => "credentials_refresh_failed",
            Self::CredentialStorage(_) => "credential_storage",
            Self::RemoteNotFound { .. } => "remote_not_found",
            Self::RemotePermissionDenied { .. } => "remote_permission_denied",
            Self::RemoteQuotaExceeded { .. } => "remote_quota_exceeded",
            Self::RenderingToolUnavailable { .. } => "rendering_tool_unavailable",
            Self::PageProcessingFailed { .. } => "page_processing_failed",
            Self::StreamUrlTimeout { .. } => "stream_url_timeout",
            Self::DownloadExhausted { .. } => "download_exhausted",
            Self::NotAFolder { .. } => "not_a_folder",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::Remote(_) => "remote",
            Self::Ledger(_) => "ledger",
            Self::Browser(_) => "browser",
            Self::Raster(_) => "raster",
            Self::Io { .. } => "io",
        }
    }
}

impl From<CredentialError> for PipelineError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unavailable { role } => Self::CredentialsUnavailable { role },
            CredentialError::RefreshFailed { role, reason } => {
                Self::CredentialsRefreshFailed { role, reason }
            }
            CredentialError::Storage(e) => Self::CredentialStorage(e),
        }
    }
}

impl From<RemoteError> for PipelineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { resource_id } => Self::RemoteNotFound { resource_id },
            RemoteError::PermissionDenied {
                resource_id,
                message,
            } => Self::RemotePermissionDenied {
                resource_id,
                message,
            },
            RemoteError::QuotaExceeded {
                resource_id,
                message,
                ..
            } => Self::RemoteQuotaExceeded {
                resource_id,
                message,
            },
            RemoteError::Credentials(e) => e.into(),
            other => Self::Remote(other),
        }
    }
}

impl From<RasterError> for PipelineError {
    fn from(err: RasterError) -> Self {
        match err {
            RasterError::RenderingToolUnavailable { searched } => {
                Self::RenderingToolUnavailable { searched }
            }
            RasterError::PageProcessingFailed { page_index, cause } => {
                Self::PageProcessingFailed { page_index, cause }
            }
            other => Self::Raster(other),
        }
    }
}

impl From<VideoError> for PipelineError {
    fn from(err: VideoError) -> Self {
        match err {
            VideoError::StreamUrlTimeout {
                resource_id,
                waited,
            } => Self::StreamUrlTimeout {
                resource_id,
                waited,
            },
            VideoError::DownloadExhausted {
                resource_id,
                attempts,
                last_cause,
            } => Self::DownloadExhausted {
                resource_id,
                attempts,
                last_cause,
            },
            VideoError::Browser(e) => Self::Browser(e),
            VideoError::Remote(e) => e.into(),
            VideoError::Credentials(e) => e.into(),
        }
    }
}

impl From<GuardError> for PipelineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Ledger(e) => Self::Ledger(e),
            GuardError::Remote(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_errors_flatten_into_taxonomy() {
        let err: PipelineError = RemoteError::NotFound {
            resource_id: "abc".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::RemoteNotFound { .. }));
        assert_eq!(err.kind(), "remote_not_found");

        let err: PipelineError =
            RemoteError::Credentials(CredentialError::Unavailable { role: Role::Upload }).into();
        assert!(matches!(
            err,
            PipelineError::CredentialsUnavailable { role: Role::Upload }
        ));
    }

    #[test]
    fn test_page_failure_keeps_index() {
        let err: PipelineError = RasterError::PageProcessingFailed {
            page_index: 4,
            cause: "renderer crashed".into(),
        }
        .into();
        assert_eq!(err.to_string(), "page 5 failed: renderer crashed");
    }

    #[test]
    fn test_video_exhaustion_keeps_last_cause() {
        let err: PipelineError = VideoError::DownloadExhausted {
            resource_id: "vid".into(),
            attempts: 5,
            last_cause: "quota exceeded on vid: limit".into(),
        }
        .into();
        assert_eq!(err.kind(), "download_exhausted");
        assert!(err.to_string().contains("5 attempts"));
    }
}

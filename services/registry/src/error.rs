//! Error types for the registry

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Coarse classification of failures, used in sync reports and for shared failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Content did not hash to its claimed digest.
    Verification,

    /// Unknown or unsupported manifest media type.
    UnsupportedSchema,

    /// The tag, manifest or blob does not exist.
    NotFound,

    /// The upstream could not be reached, or kept failing.
    UpstreamUnavailable,

    /// The upstream asked us to slow down.
    RateLimited,

    /// A token was missing, invalid, expired or lacked scope.
    Auth,

    /// A manifest list references manifests which could not be resolved.
    InconsistentGraph,

    /// Malformed input: digests, names, manifests, ranges.
    Invalid,

    /// The operation was cancelled.
    Cancelled,

    /// The backing object store failed.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Verification => "verification",
            ErrorKind::UnsupportedSchema => "unsupported schema",
            ErrorKind::NotFound => "not found",
            ErrorKind::UpstreamUnavailable => "upstream unavailable",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Auth => "auth",
            ErrorKind::InconsistentGraph => "inconsistent graph",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// A cloneable summary of an error.
///
/// Coalesced requests hand the same failure to every waiter, and sync reports persist them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// What went wrong.
    pub kind: ErrorKind,

    /// Human readable detail.
    pub message: String,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&RegistryError> for Failure {
    fn from(error: &RegistryError) -> Self {
        match error {
            RegistryError::Failed(failure) => failure.clone(),
            other => Failure::new(other.kind(), other.to_string()),
        }
    }
}

impl From<RegistryError> for Failure {
    fn from(error: RegistryError) -> Self {
        Failure::from(&error)
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for Failure {
    fn from(error: tokio::sync::broadcast::error::RecvError) -> Self {
        Failure::new(ErrorKind::Cancelled, format!("in-flight request lost: {error}"))
    }
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not known to the registry
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest algorithm outside the configured allow-list
    #[error("digest algorithm not allowed: {0}")]
    AlgorithmNotAllowed(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Record (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Range not satisfiable
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// The upstream registry failed or could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream registry rate limited us
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Missing, invalid or expired credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credentials without the required scope
    #[error("denied: {0}")]
    Denied(String),

    /// A manifest list could not be committed because children are unresolved
    #[error("inconsistent graph: {0}")]
    InconsistentGraph(String),

    /// The operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// The registry was configured inconsistently
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure shared from another task
    #[error(transparent)]
    Failed(Failure),
}

impl From<Failure> for RegistryError {
    fn from(failure: Failure) -> Self {
        RegistryError::Failed(failure)
    }
}

impl RegistryError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_) => ErrorKind::NotFound,
            RegistryError::InvalidDigest(_)
            | RegistryError::Config(_)
            | RegistryError::AlgorithmNotAllowed(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::RangeNotSatisfiable => ErrorKind::Invalid,
            RegistryError::UnsupportedManifestType(_) => ErrorKind::UnsupportedSchema,
            RegistryError::DigestMismatch { .. } => ErrorKind::Verification,
            RegistryError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            RegistryError::RateLimited(_) => ErrorKind::RateLimited,
            RegistryError::Unauthorized(_) | RegistryError::Denied(_) => ErrorKind::Auth,
            RegistryError::InconsistentGraph(_) => ErrorKind::InconsistentGraph,
            RegistryError::Cancelled => ErrorKind::Cancelled,
            RegistryError::Storage(_) | RegistryError::Serialization(_) => ErrorKind::Storage,
            RegistryError::Failed(failure) => failure.kind,
        }
    }

    /// Whether this is a not-found condition.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::Denied(_) => StatusCode::FORBIDDEN,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            other => match other.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Invalid | ErrorKind::Verification | ErrorKind::UnsupportedSchema => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Auth => StatusCode::UNAUTHORIZED,
                ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
                ErrorKind::InconsistentGraph | ErrorKind::Cancelled | ErrorKind::Storage => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) | RegistryError::RangeNotSatisfiable => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_)
            | RegistryError::AlgorithmNotAllowed(_)
            | RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::Denied(_) => "DENIED",
            RegistryError::RateLimited(_) => "TOOMANYREQUESTS",
            RegistryError::Failed(failure) => match failure.kind {
                ErrorKind::NotFound => "MANIFEST_UNKNOWN",
                ErrorKind::RateLimited => "TOOMANYREQUESTS",
                ErrorKind::Auth => "UNAUTHORIZED",
                _ => "UNKNOWN",
            },
            RegistryError::UpstreamUnavailable(_)
            | RegistryError::InconsistentGraph(_)
            | RegistryError::Cancelled => "UNSUPPORTED",
            RegistryError::Storage(_)
            | RegistryError::Serialization(_)
            | RegistryError::Config(_) => "UNKNOWN",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_keeps_kind() {
        let error = RegistryError::DigestMismatch {
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        };
        let failure = Failure::from(&error);
        assert_eq!(failure.kind, ErrorKind::Verification);

        let shared = RegistryError::from(failure.clone());
        assert_eq!(shared.kind(), ErrorKind::Verification);
        assert_eq!(Failure::from(&shared), failure);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            RegistryError::BlobNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RegistryError::RateLimited("x".into()).error_code(),
            "TOOMANYREQUESTS"
        );
        assert_eq!(
            RegistryError::Failed(Failure::new(ErrorKind::RateLimited, "slow down")).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}

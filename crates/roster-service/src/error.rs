//! Error taxonomy for the service and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roster_audit::AuditStoreError;
use roster_core::{StoreError, ValidationError, ValidationErrors};
use serde_json::json;
use thiserror::Error;

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced to callers of the record path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request is malformed.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// The subject does not exist.
    #[error("student '{student_id}' not found")]
    NotFound {
        /// The missing identifier.
        student_id: String,
    },

    /// A concurrent writer got there first.
    #[error("{0}")]
    Conflict(String),

    /// A dependency is temporarily unavailable.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// The retry budget ran out or an unrecoverable failure occurred.
    #[error("internal failure: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Returns the stable error kind reported to clients.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict(_) => "ConflictError",
            Self::Transient(_) => "TransientError",
            Self::Fatal(_) => "FatalError",
        }
    }

    /// Returns the HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if the caller may retry the request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Builds a single-field validation error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::format(field, message).into())
    }
}

impl From<ValidationError> for ServiceError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.into())
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { student_id } => Self::NotFound { student_id },
            StoreError::AlreadyExists { .. } | StoreError::VersionConflict { .. } => {
                Self::Conflict(error.to_string())
            }
            StoreError::InvalidPageToken { reason } => Self::invalid("nextToken", reason),
            StoreError::Unavailable { reason } => Self::Transient(reason),
        }
    }
}

impl From<AuditStoreError> for ServiceError {
    fn from(error: AuditStoreError) -> Self {
        match error {
            AuditStoreError::InvalidPageToken { reason } => Self::invalid("nextToken", reason),
            AuditStoreError::Unavailable { reason } => Self::Transient(reason),
            AuditStoreError::Encoding(reason) => Self::Fatal(reason),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let Self::Validation(errors) = &self {
            body["details"] = json!(errors);
        }
        (self.status(), Json(body)).into_response()
    }
}

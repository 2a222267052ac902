//! Error types for the audit store.

use thiserror::Error;

/// Result type alias for audit store operations.
pub type AuditStoreResult<T> = std::result::Result<T, AuditStoreError>;

/// Errors returned by an [`crate::AuditStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditStoreError {
    /// The store is temporarily unavailable.
    #[error("audit store unavailable: {reason}")]
    Unavailable {
        /// Failure reason.
        reason: String,
    },

    /// A pagination token did not come from this store.
    #[error("invalid page token: {reason}")]
    InvalidPageToken {
        /// Why the token was rejected.
        reason: String,
    },

    /// The entry could not be encoded for storage.
    #[error("failed to encode audit entry: {0}")]
    Encoding(String),
}

impl AuditStoreError {
    /// Returns true if the write may succeed when retried unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

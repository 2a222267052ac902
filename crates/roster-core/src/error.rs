//! Error types for record store operations.

use thiserror::Error;

/// Result type alias using [`StoreError`] as the error type.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by a [`crate::RecordStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists under the key.
    #[error("student '{student_id}' not found")]
    NotFound {
        /// The missing identifier.
        student_id: String,
    },

    /// A conditional insert found an existing record.
    #[error("student '{student_id}' already exists")]
    AlreadyExists {
        /// The conflicting identifier.
        student_id: String,
    },

    /// A conditional write lost against a concurrent writer.
    #[error("version conflict on student '{student_id}': expected {expected}, found {actual}")]
    VersionConflict {
        /// The contended identifier.
        student_id: String,
        /// Version the caller expected.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A pagination token did not come from this store.
    #[error("invalid page token: {reason}")]
    InvalidPageToken {
        /// Why the token was rejected.
        reason: String,
    },

    /// The store is temporarily unavailable.
    #[error("record store unavailable: {reason}")]
    Unavailable {
        /// Failure reason.
        reason: String,
    },
}

impl StoreError {
    /// Returns true if the operation may succeed when retried unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true for write-write collisions the caller must resolve.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::AlreadyExists { .. })
    }
}

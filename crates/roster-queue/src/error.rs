//! Error types for queue operations.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Errors returned by a [`crate::MessageQueue`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is temporarily unable to accept or hand out messages.
    #[error("queue unavailable: {reason}")]
    Unavailable {
        /// Failure reason.
        reason: String,
    },

    /// The operation did not complete in time.
    #[error("queue operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The queue holds as many messages as it is configured to.
    #[error("queue is full ({capacity} messages)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },

    /// The receipt does not belong to a message currently in flight.
    ///
    /// Happens when the visibility timeout expired and the message was
    /// redelivered under a newer receipt, or when it was already acknowledged.
    #[error("receipt '{receipt}' is not in flight")]
    ReceiptNotFound {
        /// The rejected receipt.
        receipt: String,
    },

    /// The queue has been shut down.
    #[error("queue closed")]
    Closed,
}

impl QueueError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Full { .. }
        )
    }
}

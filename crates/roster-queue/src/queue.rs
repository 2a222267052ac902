//! Queue abstraction shared by producers and consumers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Identifier assigned to a message when it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Proof of one particular receive of a message, used to acknowledge it.
///
/// Each redelivery issues a new receipt; older receipts stop working.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the receipt as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<M> {
    /// Stable message identifier.
    pub message_id: MessageId,

    /// The payload.
    pub body: M,

    /// Receipt for acknowledging this delivery.
    pub receipt: ReceiptHandle,

    /// How many times the message has been received, including this one.
    pub receive_count: u32,
}

impl<M> Delivery<M> {
    /// Returns true if an earlier receive did not acknowledge the message.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}

/// Approximate message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages ready to be received.
    pub visible: usize,
    /// Messages received but not yet acknowledged.
    pub in_flight: usize,
    /// Messages moved aside after too many receives.
    pub dead_lettered: usize,
}

/// Durable, ordered-per-producer, at-least-once channel.
#[async_trait]
pub trait MessageQueue<M>: Send + Sync
where
    M: Send + 'static,
{
    /// Enqueues a message.
    async fn send(&self, message: M) -> QueueResult<MessageId>;

    /// Receives up to `max` visible messages, waiting at most `wait` for one
    /// to become available. Returns an empty batch when the wait elapses.
    async fn receive(&self, max: usize, wait: Duration) -> QueueResult<Vec<Delivery<M>>>;

    /// Permanently removes a received message.
    async fn ack(&self, receipt: &ReceiptHandle) -> QueueResult<()>;

    /// Makes a received message visible again immediately.
    async fn release(&self, receipt: &ReceiptHandle) -> QueueResult<()>;

    /// Returns approximate message counts.
    async fn depth(&self) -> QueueResult<QueueDepth>;
}

/// Turns repeated receives into a lazy stream of deliveries.
///
/// Each poll of an exhausted batch issues another receive of up to `batch`
/// messages waiting at most `wait`. Receive errors are yielded as items; the
/// stream ends after yielding [`QueueError::Closed`].
pub fn deliveries<M, Q>(
    queue: Arc<Q>,
    batch: usize,
    wait: Duration,
) -> impl Stream<Item = QueueResult<Delivery<M>>>
where
    M: Send + 'static,
    Q: MessageQueue<M> + ?Sized + 'static,
{
    stream::unfold((queue, false), move |(queue, closed)| async move {
        if closed {
            return None;
        }
        let result = queue.receive(batch, wait).await;
        let closed = matches!(result, Err(QueueError::Closed));
        Some((result, (queue, closed)))
    })
    .flat_map(|result| match result {
        Ok(batch) => stream::iter(batch.into_iter().map(Ok)).left_stream(),
        Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
    })
}

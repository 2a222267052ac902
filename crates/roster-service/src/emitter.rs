//! Off-request-path delivery of audit events to the queue.
//!
//! The record write is the commit point of a mutation. After it, the service
//! hands the event to [`AuditEmitter::emit`], which makes one enqueue attempt
//! bounded by the send timeout and reports the outcome. Further attempts run
//! on a detached task with exponential backoff; an event that still cannot be
//! enqueued goes to the dead-letter router. Nothing here fails the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roster_audit::{AuditEvent, DeadLetter, DeadLetterRouter};
use roster_queue::{MessageId, MessageQueue, QueueError, QueueResult};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::EmitterConfig;

/// Result of the inline enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The event is in the queue.
    Enqueued(MessageId),
    /// The first attempt failed or timed out; delivery continues in the background.
    Deferred,
}

/// Counters for emitted events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitterStats {
    /// Events that reached the queue.
    pub enqueued: u64,
    /// Events whose first attempt failed.
    pub deferred: u64,
    /// Events handed to the dead-letter path.
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
}

struct Inner {
    queue: Arc<dyn MessageQueue<AuditEvent>>,
    config: EmitterConfig,
    dead_letters: DeadLetterRouter,
    pending: watch::Sender<usize>,
    counters: Counters,
}

/// Enqueues audit events without ever failing the request that produced them.
#[derive(Clone)]
pub struct AuditEmitter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEmitter")
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Keeps the pending count raised while a delivery task is alive.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn start(inner: Arc<Inner>) -> Self {
        inner.pending.send_modify(|count| *count += 1);
        Self(inner)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.pending.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl AuditEmitter {
    /// Creates an emitter writing to `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue<AuditEvent>>,
        config: EmitterConfig,
        dead_letters: DeadLetterRouter,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queue,
                config,
                dead_letters,
                pending,
                counters: Counters::default(),
            }),
        }
    }

    /// Starts delivery of `event` and waits for the first attempt only.
    ///
    /// Delivery runs on its own task, so dropping the returned future does
    /// not cancel it.
    pub async fn emit(&self, event: AuditEvent) -> EmitOutcome {
        let (first_tx, first_rx) = oneshot::channel();
        let task = InFlight::start(Arc::clone(&self.inner));
        tokio::spawn(async move {
            task.0.deliver(event, first_tx).await;
            drop(task);
        });

        match first_rx.await {
            Ok(Some(message_id)) => EmitOutcome::Enqueued(message_id),
            _ => EmitOutcome::Deferred,
        }
    }

    /// Number of events still being delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Waits until every started delivery has finished, up to `timeout`.
    ///
    /// Returns false if deliveries were still running when the time ran out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.subscribe();
        let idle = async { pending.wait_for(|count| *count == 0).await.is_ok() };
        let drained = matches!(tokio::time::timeout(timeout, idle).await, Ok(true));
        if drained {
            self.inner.dead_letters.flush();
        } else {
            warn!(
                pending = self.pending(),
                "audit deliveries still running at drain deadline"
            );
        }
        drained
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        let counters = &self.inner.counters;
        EmitterStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            deferred: counters.deferred.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn send_once(&self, event: AuditEvent) -> QueueResult<MessageId> {
        tokio::time::timeout(self.config.send_timeout, self.queue.send(event))
            .await
            .unwrap_or_else(|_| {
                Err(QueueError::Timeout {
                    operation: "send".to_string(),
                })
            })
    }

    async fn deliver(&self, event: AuditEvent, first: oneshot::Sender<Option<MessageId>>) {
        let mut first = Some(first);
        let result = self
            .config
            .retry
            .run("audit_enqueue", |attempt| {
                let first = first.take();
                let event = event.clone();
                async move {
                    let audit_id = event.audit_id;
                    let result = self.send_once(event).await;
                    if let Some(first) = first {
                        if let Err(e) = &result {
                            self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                audit_id = %audit_id,
                                attempt,
                                error = %e,
                                "audit enqueue failed on request path, continuing in background"
                            );
                        }
                        // The request may already be gone.
                        let _ = first.send(result.as_ref().ok().copied());
                    }
                    result
                }
            })
            .await;

        match result {
            Ok(message_id) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(
                    state = "EVENT_ENQUEUED",
                    audit_id = %event.audit_id,
                    student_id = %event.student_id,
                    message_id = %message_id,
                    "audit event enqueued"
                );
            }
            Err(failure) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                error!(
                    state = "ENQUEUE_FAILED_LOGGED",
                    audit_id = %event.audit_id,
                    student_id = %event.student_id,
                    action = event.action.as_str(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "giving up on audit event"
                );
                let letter = DeadLetter::new(event, failure.error.to_string(), failure.attempts);
                let accepted = self.dead_letters.route(&letter);
                info!(accepted, "audit event written to dead-letter path");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use roster_audit::InMemoryDeadLetterSink;
    use roster_core::StudentId;
    use roster_queue::{Delivery, InMemoryQueue, QueueConfig, QueueDepth, ReceiptHandle};
    use std::sync::atomic::AtomicU32;

    /// Queue that fails the first `failures` sends, or hangs when `hang` is set.
    struct FlakyQueue {
        inner: InMemoryQueue<AuditEvent>,
        failures: AtomicU32,
        error: QueueError,
        hang: bool,
    }

    impl FlakyQueue {
        fn failing(failures: u32, error: QueueError) -> Self {
            Self {
                inner: InMemoryQueue::new(QueueConfig::default()),
                failures: AtomicU32::new(failures),
                error,
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::failing(0, QueueError::Closed)
            }
        }
    }

    #[async_trait]
    impl MessageQueue<AuditEvent> for FlakyQueue {
        async fn send(&self, message: AuditEvent) -> QueueResult<MessageId> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.send(message).await
        }

        async fn receive(&self, max: usize, wait: Duration) -> QueueResult<Vec<Delivery<AuditEvent>>> {
            self.inner.receive(max, wait).await
        }

        async fn ack(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
            self.inner.ack(receipt).await
        }

        async fn release(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
            self.inner.release(receipt).await
        }

        async fn depth(&self) -> QueueResult<QueueDepth> {
            self.inner.depth().await
        }
    }

    fn unavailable() -> QueueError {
        QueueError::Unavailable {
            reason: "throttled".to_string(),
        }
    }

    fn event() -> AuditEvent {
        AuditEvent::created(StudentId::parse("S1").unwrap()).with_request_id("req-1")
    }

    fn emitter(
        queue: Arc<dyn MessageQueue<AuditEvent>>,
    ) -> (AuditEmitter, Arc<InMemoryDeadLetterSink>) {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let router = DeadLetterRouter::new().with_sink(sink.clone());
        (
            AuditEmitter::new(queue, EmitterConfig::default(), router),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_queue_enqueues_inline() {
        let queue = Arc::new(InMemoryQueue::new(QueueConfig::default()));
        let (emitter, sink) = emitter(queue.clone());

        let outcome = emitter.emit(event()).await;
        assert!(matches!(outcome, EmitOutcome::Enqueued(_)));

        assert!(emitter.drain(Duration::from_secs(1)).await);
        assert_eq!(queue.depth().await.unwrap().visible, 1);
        assert!(sink.letters().is_empty());
        assert_eq!(emitter.stats().enqueued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_retry_recovers() {
        let queue = Arc::new(FlakyQueue::failing(2, unavailable()));
        let (emitter, sink) = emitter(queue.clone());

        assert_eq!(emitter.emit(event()).await, EmitOutcome::Deferred);
        assert!(emitter.drain(Duration::from_secs(30)).await);

        let delivered = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body.request_id.as_deref(), Some("req-1"));
        assert!(sink.letters().is_empty());
        assert_eq!(
            emitter.stats(),
            EmitterStats {
                enqueued: 1,
                deferred: 1,
                dead_lettered: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reach_dead_letter_sink() {
        let queue = Arc::new(FlakyQueue::failing(u32::MAX, unavailable()));
        let (emitter, sink) = emitter(queue);
        let event = event();

        assert_eq!(emitter.emit(event.clone()).await, EmitOutcome::Deferred);
        assert!(emitter.drain(Duration::from_secs(60)).await);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event, event);
        assert_eq!(letters[0].attempts, RetryPolicy::default().max_attempts);
        assert!(letters[0].reason.contains("throttled"));
        assert_eq!(emitter.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_dead_letters_without_retry() {
        let queue = Arc::new(FlakyQueue::failing(u32::MAX, QueueError::Closed));
        let (emitter, sink) = emitter(queue);

        emitter.emit(event()).await;
        assert!(emitter.drain(Duration::from_secs(1)).await);
        assert_eq!(sink.letters()[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_queue_is_bounded_by_send_timeout() {
        let (emitter, sink) = emitter(Arc::new(FlakyQueue::hanging()));

        let started = tokio::time::Instant::now();
        assert_eq!(emitter.emit(event()).await, EmitOutcome::Deferred);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_secs(1));

        assert_eq!(emitter.pending(), 1);
        assert!(emitter.drain(Duration::from_secs(60)).await);
        assert_eq!(sink.letters().len(), 1);
        assert!(sink.letters()[0].reason.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_survives_dropped_caller() {
        let queue = Arc::new(FlakyQueue::failing(1, unavailable()));
        let (emitter, _sink) = emitter(queue.clone());

        // The caller may give up before the first attempt reports back.
        let _ = tokio::time::timeout(Duration::from_millis(1), emitter.emit(event())).await;

        assert!(emitter.drain(Duration::from_secs(30)).await);
        assert_eq!(queue.depth().await.unwrap().visible, 1);
    }
}

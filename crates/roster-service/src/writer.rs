//! Queue consumer that persists audit events.
//!
//! A worker receives a batch, upserts each event into the audit store keyed
//! by its audit id and acknowledges the message only after the write is
//! confirmed. A message whose write keeps failing is left unacknowledged so
//! the queue redelivers it after the visibility timeout. The writer never
//! drops a message on its own.

use std::sync::Arc;

use roster_audit::{AuditEvent, AuditLogEntry, AuditStore, UpsertOutcome};
use roster_queue::{Delivery, MessageQueue, QueueError, QueueResult};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Messages received.
    pub received: usize,
    /// New or changed audit entries written.
    pub persisted: usize,
    /// Redeliveries of entries already stored.
    pub duplicates: usize,
    /// Messages left unacknowledged because the store write failed.
    pub failed: usize,
    /// Messages persisted but whose acknowledgement failed.
    pub ack_failures: usize,
}

impl BatchReport {
    fn merge(&mut self, other: Self) {
        self.received += other.received;
        self.persisted += other.persisted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.ack_failures += other.ack_failures;
    }
}

/// Moves audit events from the queue into the audit store.
#[derive(Clone)]
pub struct AuditWriter {
    queue: Arc<dyn MessageQueue<AuditEvent>>,
    store: Arc<dyn AuditStore>,
    config: WriterConfig,
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AuditWriter {
    /// Creates a writer.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue<AuditEvent>>,
        store: Arc<dyn AuditStore>,
        config: WriterConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// Receives and processes one batch.
    ///
    /// # Errors
    ///
    /// Returns an error only if the receive itself fails.
    pub async fn process_batch(&self) -> QueueResult<BatchReport> {
        let deliveries = self
            .queue
            .receive(self.config.batch_size, self.config.wait_time)
            .await?;
        Ok(self.persist(deliveries).await)
    }

    /// Processes batches until the queue stays empty for one long-poll wait.
    ///
    /// # Errors
    ///
    /// Returns an error if a receive fails.
    pub async fn drain(&self) -> QueueResult<BatchReport> {
        let mut total = BatchReport::default();
        loop {
            let report = self.process_batch().await?;
            if report.received == 0 {
                return Ok(total);
            }
            total.merge(report);
        }
    }

    async fn persist(&self, deliveries: Vec<Delivery<AuditEvent>>) -> BatchReport {
        let mut report = BatchReport {
            received: deliveries.len(),
            ..BatchReport::default()
        };

        for delivery in deliveries {
            let audit_id = delivery.body.audit_id;
            let redelivery = delivery.is_redelivery();
            let entry = AuditLogEntry::ingest(delivery.body);
            let written = self
                .config
                .store_retry
                .run("audit_upsert", |_| self.store.upsert(entry.clone()))
                .await;

            match written {
                Ok(UpsertOutcome::Unchanged) => report.duplicates += 1,
                Ok(UpsertOutcome::Inserted | UpsertOutcome::Overwritten) => report.persisted += 1,
                Err(failure) => {
                    report.failed += 1;
                    warn!(
                        audit_id = %audit_id,
                        message_id = %delivery.message_id,
                        receive_count = delivery.receive_count,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "audit write failed, leaving message for redelivery"
                    );
                    continue;
                }
            }

            if let Err(e) = self.queue.ack(&delivery.receipt).await {
                // Persisted already; a redelivery is absorbed by the upsert.
                report.ack_failures += 1;
                warn!(
                    audit_id = %audit_id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "failed to acknowledge persisted audit event"
                );
            } else {
                debug!(
                    audit_id = %audit_id,
                    redelivery,
                    "audit event persisted"
                );
            }
        }
        report
    }

    /// Processes batches until `shutdown` turns true or the queue closes.
    ///
    /// A batch already received is always finished before returning.
    pub async fn run(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "audit writer started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self
                    .queue
                    .receive(self.config.batch_size, self.config.wait_time) => received,
            };

            match received {
                Ok(deliveries) if deliveries.is_empty() => {}
                Ok(deliveries) => {
                    let report = self.persist(deliveries).await;
                    debug!(
                        worker,
                        received = report.received,
                        persisted = report.persisted,
                        duplicates = report.duplicates,
                        failed = report.failed,
                        "audit batch processed"
                    );
                }
                Err(QueueError::Closed) => {
                    info!(worker, "audit queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "audit receive failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        info!(worker, "audit writer stopped");
    }

    /// Starts the configured number of workers.
    #[must_use]
    pub fn spawn_workers(&self) -> WriterHandle {
        let (shutdown, receiver) = watch::channel(false);
        let workers = (0..self.config.workers.max(1))
            .map(|worker| {
                let writer = self.clone();
                let shutdown = receiver.clone();
                tokio::spawn(async move { writer.run(worker, shutdown).await })
            })
            .collect();
        WriterHandle { shutdown, workers }
    }
}

/// Running writer workers.
#[derive(Debug)]
pub struct WriterHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WriterHandle {
    /// Number of running workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for them to finish their batch.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                warn!(error = %e, "audit writer task failed");
            }
        }
    }
}

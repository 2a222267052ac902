//! Student record service with an asynchronous, at-least-once audit trail.
//!
//! The pieces:
//! - [`StudentService`] validates input, writes the record store and hands
//!   an audit event to the [`AuditEmitter`]
//! - [`AuditEmitter`] enqueues events off the request path, retrying with
//!   backoff and falling back to dead-letter sinks
//! - [`AuditWriter`] drains the queue into the audit store, acknowledging
//!   only after each write is confirmed
//! - [`AuditQuery`] reads the audit store
//! - [`http::build_router`] exposes all of it over HTTP
//!
//! [`Roster`] wires them together over in-memory or caller-supplied stores.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use roster_audit::AuditFilter;
//! use roster_core::PageRequest;
//! use roster_service::{RequestContext, Roster, RosterConfig};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let roster = Roster::builder(RosterConfig::default()).build().unwrap();
//! let ctx = RequestContext::generate();
//!
//! let record = roster
//!     .service()
//!     .create_student(&ctx, json!({ "name": "Asha" }))
//!     .await
//!     .unwrap();
//!
//! roster.service().emitter().drain(Duration::from_secs(1)).await;
//! roster.writer().process_batch().await.unwrap();
//!
//! let audits = roster
//!     .query()
//!     .list_audit_entries(&AuditFilter::for_student(record.student_id), &PageRequest::default())
//!     .await
//!     .unwrap();
//! assert_eq!(audits.items.len(), 1);
//! # });
//! ```

pub mod config;
pub mod emitter;
pub mod error;
pub mod http;
pub mod query;
pub mod retry;
pub mod service;
pub mod writer;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use roster_audit::{
    AuditEvent, AuditStore, DeadLetterRouter, DeadLetterSink, InMemoryAuditStore,
    JsonLinesDeadLetterSink, TracingDeadLetterSink,
};
use roster_core::{InMemoryRecordStore, RecordStore};
use roster_queue::{InMemoryQueue, MessageQueue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use config::{
    ConfigError, EmitterConfig, HttpConfig, RosterConfig, ServiceLimits, WriterConfig,
};
pub use emitter::{AuditEmitter, EmitOutcome, EmitterStats};
pub use error::{Result, ServiceError};
pub use query::AuditQuery;
pub use retry::{RetryFailure, RetryPolicy, Retryable};
pub use service::{BulkDeleteFailure, BulkDeleteReport, RequestContext, StudentService};
pub use writer::{AuditWriter, BatchReport, WriterHandle};

/// A fully wired service instance.
#[derive(Clone)]
pub struct Roster {
    config: RosterConfig,
    queue: Arc<dyn MessageQueue<AuditEvent>>,
    service: StudentService,
    query: AuditQuery,
    writer: AuditWriter,
}

impl std::fmt::Debug for Roster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Roster`]. Unset handles default to in-memory implementations.
#[derive(Default)]
pub struct RosterBuilder {
    config: RosterConfig,
    records: Option<Arc<dyn RecordStore>>,
    audits: Option<Arc<dyn AuditStore>>,
    queue: Option<Arc<dyn MessageQueue<AuditEvent>>>,
    sinks: Vec<Arc<dyn DeadLetterSink>>,
}

impl RosterBuilder {
    /// Uses `records` as the record store.
    #[must_use]
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Uses `audits` as the audit store.
    #[must_use]
    pub fn audit_store(mut self, audits: Arc<dyn AuditStore>) -> Self {
        self.audits = Some(audits);
        self
    }

    /// Uses `queue` as the audit event queue.
    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn MessageQueue<AuditEvent>>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Adds a dead-letter sink next to the configured ones.
    #[must_use]
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validates the configuration and wires every component.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the dead-letter
    /// file cannot be opened.
    pub fn build(self) -> std::result::Result<Roster, ConfigError> {
        let config = self.config;
        config.validate()?;

        let records = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let audits = self
            .audits
            .unwrap_or_else(|| Arc::new(InMemoryAuditStore::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new(config.queue.clone())));

        let mut dead_letters =
            DeadLetterRouter::new().with_sink(Arc::new(TracingDeadLetterSink::new()));
        if let Some(path) = &config.emitter.dead_letter_file {
            dead_letters =
                dead_letters.with_sink(Arc::new(JsonLinesDeadLetterSink::open(path)?));
        }
        for sink in self.sinks {
            dead_letters = dead_letters.with_sink(sink);
        }

        let emitter =
            AuditEmitter::new(Arc::clone(&queue), config.emitter.clone(), dead_letters);
        let service = StudentService::new(
            records,
            emitter,
            config.limits.clone(),
            config.record_retry.clone(),
        );
        let query = AuditQuery::new(Arc::clone(&audits));
        let writer = AuditWriter::new(Arc::clone(&queue), audits, config.writer.clone());

        Ok(Roster {
            config,
            queue,
            service,
            query,
            writer,
        })
    }
}

impl Roster {
    /// Starts building an instance from `config`.
    #[must_use]
    pub fn builder(config: RosterConfig) -> RosterBuilder {
        RosterBuilder {
            config,
            ..RosterBuilder::default()
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RosterConfig {
        &self.config
    }

    /// Returns the student service.
    #[must_use]
    pub const fn service(&self) -> &StudentService {
        &self.service
    }

    /// Returns the audit query.
    #[must_use]
    pub const fn query(&self) -> &AuditQuery {
        &self.query
    }

    /// Returns the audit writer.
    #[must_use]
    pub const fn writer(&self) -> &AuditWriter {
        &self.writer
    }

    /// Builds the HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        http::build_router(http::AppState {
            service: self.service.clone(),
            query: self.query.clone(),
            queue: Arc::clone(&self.queue),
        })
    }

    /// Serves HTTP on `listener` with writer workers running until `shutdown`
    /// resolves.
    ///
    /// On shutdown the listener stops accepting, in-flight requests finish,
    /// pending audit emissions are drained and the writers complete their
    /// current batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let writers = self.writer.spawn_workers();
        info!(
            addr = ?listener.local_addr().ok(),
            writers = writers.worker_count(),
            "roster listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("http server stopped, draining audit emissions");
        if !self
            .service
            .emitter()
            .drain(self.config.http.shutdown_grace)
            .await
        {
            warn!("shutdown grace elapsed with audit emissions still pending");
        }
        writers.shutdown().await;
        info!("roster stopped");
        Ok(())
    }
}

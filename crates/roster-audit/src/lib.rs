//! Audit trail types and storage for the Roster student service.
//!
//! This crate provides:
//! - [`AuditEvent`], the message emitted for every committed mutation
//! - [`AuditLogEntry`], the persisted form, upserted by audit id
//! - The [`AuditStore`] trait with an in-memory implementation
//! - Dead-letter sinks for events whose delivery was abandoned
//!
//! # Example
//!
//! ```rust
//! use roster_audit::{AuditEvent, AuditLogEntry, AuditStore, InMemoryAuditStore, UpsertOutcome};
//! use roster_core::StudentId;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryAuditStore::new();
//! let event = AuditEvent::created(StudentId::parse("S1").unwrap());
//!
//! let entry = AuditLogEntry::ingest(event.clone());
//! assert_eq!(store.upsert(entry.clone()).await.unwrap(), UpsertOutcome::Inserted);
//!
//! // Redelivery of the same event is a no-op.
//! let again = AuditLogEntry::ingest(event);
//! assert_eq!(store.upsert(again).await.unwrap(), UpsertOutcome::Unchanged);
//! # });
//! ```

mod dead_letter;
mod error;
mod event;
mod store;

pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterRouter, DeadLetterSink, InMemoryDeadLetterSink,
    JsonLinesDeadLetterSink, TracingDeadLetterSink,
};
pub use error::{AuditStoreError, AuditStoreResult};
pub use event::{AuditAction, AuditEvent, AuditFilter, AuditLogEntry};
pub use store::{AuditStore, InMemoryAuditStore, UpsertOutcome};

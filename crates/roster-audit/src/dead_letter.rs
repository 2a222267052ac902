//! Dead-letter path for audit events whose delivery was abandoned.
//!
//! Losing an audit event is a degraded but survivable condition. Every
//! abandoned event is handed to one or more sinks so an operator can replay
//! it later. Sink failures are logged and never propagate to the caller.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::event::AuditEvent;

/// An audit event that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The undelivered event.
    pub event: AuditEvent,

    /// Last error seen.
    pub reason: String,

    /// Enqueue attempts made before giving up.
    pub attempts: u32,

    /// When delivery was abandoned.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter stamped now.
    #[must_use]
    pub fn new(event: AuditEvent, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            event,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Errors raised by a dead-letter sink.
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    /// Serialization error.
    #[error("failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("dead-letter I/O error on {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync + Debug {
    /// Records one dead letter.
    ///
    /// # Errors
    ///
    /// Returns an error if the letter cannot be recorded.
    fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;

    /// Flushes any buffered letters.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> Result<(), DeadLetterError>;

    /// Returns the sink name for identification.
    fn name(&self) -> &'static str;
}

/// Fans dead letters out to every configured sink.
#[derive(Debug, Default, Clone)]
pub struct DeadLetterRouter {
    sinks: Vec<Arc<dyn DeadLetterSink>>,
}

impl DeadLetterRouter {
    /// Creates a router with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Returns the number of configured sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Hands `letter` to every sink.
    ///
    /// Returns how many sinks accepted it; failures are logged.
    pub fn route(&self, letter: &DeadLetter) -> usize {
        if self.sinks.is_empty() {
            error!(
                log_type = "audit_dead_letter",
                audit_id = %letter.event.audit_id,
                student_id = %letter.event.student_id,
                "no dead-letter sink configured, audit event dropped"
            );
            return 0;
        }

        let mut accepted = 0;
        for sink in &self.sinks {
            match sink.record(letter) {
                Ok(()) => accepted += 1,
                Err(e) => error!(
                    sink = sink.name(),
                    audit_id = %letter.event.audit_id,
                    error = %e,
                    "failed to record dead letter"
                ),
            }
        }
        accepted
    }

    /// Flushes all sinks, logging failures.
    pub fn flush(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                warn!(sink = sink.name(), error = %e, "failed to flush dead-letter sink");
            }
        }
    }
}

/// Sink that logs dead letters through `tracing`.
#[derive(Debug, Default)]
pub struct TracingDeadLetterSink;

impl TracingDeadLetterSink {
    /// Creates a tracing sink.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DeadLetterSink for TracingDeadLetterSink {
    fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let json = serde_json::to_string(letter)?;
        error!(
            log_type = "audit_dead_letter",
            audit_id = %letter.event.audit_id,
            student_id = %letter.event.student_id,
            action = letter.event.action.as_str(),
            attempts = letter.attempts,
            dead_letter = %json,
            "audit event abandoned after retries"
        );
        Ok(())
    }

    fn flush(&self) -> Result<(), DeadLetterError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Sink that appends one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonLinesDeadLetterSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesDeadLetterSink {
    /// Opens (or creates) `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| DeadLetterError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "opened dead-letter file");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> DeadLetterError {
        DeadLetterError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl DeadLetterSink for JsonLinesDeadLetterSink {
    fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');
        self.file
            .lock()
            .write_all(&line)
            .map_err(|e| self.io_error(e))
    }

    fn flush(&self) -> Result<(), DeadLetterError> {
        let file = self.file.lock();
        file.sync_data().map_err(|e| self.io_error(e))
    }

    fn name(&self) -> &'static str {
        "json_lines"
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded letters.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Clears recorded letters.
    pub fn clear(&self) {
        self.letters.lock().clear();
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.letters.lock().push(letter.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), DeadLetterError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

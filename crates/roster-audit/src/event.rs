//! Audit event definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use roster_core::{StudentId, Validate, ValidationError, ValidationErrors};
use serde::{Deserialize, Serialize};
use uuid::{Timestamp, Uuid};

/// Generates a new v7 UUID for audit events.
fn new_audit_id() -> Uuid {
    let ts = Timestamp::now(uuid::NoContext);
    Uuid::new_v7(ts)
}

/// The mutation an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// A student record was created.
    Create,
    /// A student record was replaced.
    Update,
    /// A student record was removed.
    Delete,
}

impl AuditAction {
    /// Returns the wire name of the action.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A "mutation happened" message in transit from the service to the writer.
///
/// `audit_id` is the idempotency key: the writer may see the same event more
/// than once and must store it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event ID, assigned at emission.
    pub audit_id: Uuid,

    /// Subject of the mutation.
    pub student_id: StudentId,

    /// What happened.
    pub action: AuditAction,

    /// Emission time.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AuditEvent {
    /// Creates an event for `action` on `student_id`, stamped now.
    #[must_use]
    pub fn new(student_id: StudentId, action: AuditAction) -> Self {
        Self {
            audit_id: new_audit_id(),
            student_id,
            action,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    /// Creates a record-created event.
    #[must_use]
    pub fn created(student_id: StudentId) -> Self {
        Self::new(student_id, AuditAction::Create)
    }

    /// Creates a record-updated event.
    #[must_use]
    pub fn updated(student_id: StudentId) -> Self {
        Self::new(student_id, AuditAction::Update)
    }

    /// Creates a record-deleted event.
    #[must_use]
    pub fn deleted(student_id: StudentId) -> Self {
        Self::new(student_id, AuditAction::Delete)
    }

    /// Sets the correlation ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the correlation ID if one is present.
    #[must_use]
    pub fn with_optional_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// The persisted form of an [`AuditEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// The event as emitted.
    #[serde(flatten)]
    pub event: AuditEvent,

    /// When the writer first processed the event.
    pub ingested_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Wraps an event received now.
    #[must_use]
    pub fn ingest(event: AuditEvent) -> Self {
        Self::ingest_at(event, Utc::now())
    }

    /// Wraps an event with an explicit processing time.
    #[must_use]
    pub const fn ingest_at(event: AuditEvent, ingested_at: DateTime<Utc>) -> Self {
        Self { event, ingested_at }
    }

    /// The idempotency key.
    #[must_use]
    pub const fn audit_id(&self) -> Uuid {
        self.event.audit_id
    }
}

/// Read-side filter over audit entries. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    /// Only entries about this student.
    #[serde(default)]
    pub student_id: Option<StudentId>,

    /// Only entries emitted at or after this time.
    #[serde(default)]
    pub from_time: Option<DateTime<Utc>>,

    /// Only entries emitted at or before this time.
    #[serde(default)]
    pub to_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// A filter that matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one student.
    #[must_use]
    pub fn for_student(student_id: StudentId) -> Self {
        Self {
            student_id: Some(student_id),
            ..Self::default()
        }
    }

    /// Sets the inclusive time window.
    #[must_use]
    pub fn between(
        mut self,
        from_time: Option<DateTime<Utc>>,
        to_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.from_time = from_time;
        self.to_time = to_time;
        self
    }

    /// Returns true if `entry` passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        let event = &entry.event;
        self.student_id
            .as_ref()
            .is_none_or(|id| *id == event.student_id)
            && self.from_time.is_none_or(|from| event.timestamp >= from)
            && self.to_time.is_none_or(|to| event.timestamp <= to)
    }
}

impl Validate for AuditFilter {
    fn validate(&self) -> Result<(), ValidationErrors> {
        if let (Some(from), Some(to)) = (self.from_time, self.to_time) {
            if from > to {
                return Err(ValidationError::constraint(
                    "from",
                    "'from' must not be later than 'to'",
                )
                .into());
            }
        }
        Ok(())
    }
}

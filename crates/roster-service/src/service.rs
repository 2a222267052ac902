//! Student record operations.
//!
//! Every mutation follows the same order: validate, write the record store,
//! then hand an audit event to the emitter. The record write is the commit
//! point; emission problems are logged and never change the result.

use std::collections::HashSet;
use std::sync::Arc;

use roster_audit::AuditEvent;
use roster_core::{
    Attributes, Page, PageRequest, RecordStore, StoreError, StudentId, StudentRecord,
    ValidationError, ValidationErrors,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceLimits;
use crate::emitter::{AuditEmitter, EmitOutcome};
use crate::error::{Result, ServiceError};
use crate::retry::{RetryFailure, RetryPolicy};

/// Per-request correlation data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation id copied into emitted audit events.
    pub request_id: String,
}

impl RequestContext {
    /// Creates a context with a caller-supplied request id.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::generate()
    }
}

/// Outcome of one id in a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteFailure {
    /// The id that could not be deleted.
    pub student_id: StudentId,
    /// Error kind.
    pub error: String,
    /// Error text.
    pub message: String,
}

/// Result of a bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteReport {
    /// Ids that were deleted (each emitted one `DELETE` event).
    pub deleted: Vec<StudentId>,
    /// Ids that did not exist.
    pub not_found: Vec<StudentId>,
    /// Ids whose deletion failed for another reason.
    pub failed: Vec<BulkDeleteFailure>,
}

/// Validates input, mutates the record store and emits audit events.
#[derive(Clone)]
pub struct StudentService {
    records: Arc<dyn RecordStore>,
    emitter: AuditEmitter,
    limits: ServiceLimits,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StudentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudentService")
            .field("limits", &self.limits)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Converts a request body into an attribute map.
fn into_attributes(body: Value) -> std::result::Result<Attributes, ValidationError> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::format(
            "attributes",
            format!("expected a JSON object, got {}", json_type(&other)),
        )),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Maps a record store failure after retries.
fn store_failure(failure: RetryFailure<StoreError>) -> ServiceError {
    if failure.exhausted() {
        ServiceError::Fatal(format!(
            "record store still failing after {} attempts: {}",
            failure.attempts, failure.error
        ))
    } else {
        failure.error.into()
    }
}

impl StudentService {
    /// Creates a service over `records`, emitting through `emitter`.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        emitter: AuditEmitter,
        limits: ServiceLimits,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            records,
            emitter,
            limits,
            retry,
        }
    }

    /// Returns the emitter used for audit events.
    #[must_use]
    pub const fn emitter(&self) -> &AuditEmitter {
        &self.emitter
    }

    fn check_attributes(&self, body: Value) -> Result<Attributes> {
        let attributes = into_attributes(body)?;
        self.limits.attributes.check(&attributes)?;
        Ok(attributes)
    }

    async fn emit(&self, ctx: &RequestContext, event: AuditEvent) {
        let audit_id = event.audit_id;
        let action = event.action;
        match self
            .emitter
            .emit(event.with_request_id(ctx.request_id.clone()))
            .await
        {
            EmitOutcome::Enqueued(message_id) => debug!(
                audit_id = %audit_id,
                action = action.as_str(),
                message_id = %message_id,
                "audit event enqueued"
            ),
            EmitOutcome::Deferred => warn!(
                audit_id = %audit_id,
                action = action.as_str(),
                request_id = %ctx.request_id,
                "audit event deferred"
            ),
        }
    }

    /// Creates a record under a generated id and emits `CREATE`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed body, or a store failure.
    pub async fn create_student(&self, ctx: &RequestContext, body: Value) -> Result<StudentRecord> {
        let attributes = self.check_attributes(body)?;
        let record = StudentRecord::new(StudentId::generate(), attributes);

        let stored = self
            .retry
            .run("record_insert", |_| self.records.insert(record.clone()))
            .await
            .map_err(store_failure)?;

        info!(
            student_id = %stored.student_id,
            request_id = %ctx.request_id,
            "student created"
        );
        self.emit(ctx, AuditEvent::created(stored.student_id.clone()))
            .await;
        Ok(stored)
    }

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record exists.
    pub async fn get_student(&self, student_id: &StudentId) -> Result<StudentRecord> {
        self.records
            .get(student_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                student_id: student_id.to_string(),
            })
    }

    /// Replaces the attributes of a record and emits `UPDATE`.
    ///
    /// With `expected_version`, the write only succeeds if the record is still
    /// at that version. Without it, the version read just before the write is
    /// used, so a concurrent writer in between still causes a conflict.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, a validation error, or `Conflict` when another
    /// write landed first.
    pub async fn update_student(
        &self,
        ctx: &RequestContext,
        student_id: &StudentId,
        body: Value,
        expected_version: Option<u64>,
    ) -> Result<StudentRecord> {
        let attributes = self.check_attributes(body)?;
        let expected = match expected_version {
            Some(version) => version,
            None => self.get_student(student_id).await?.version,
        };

        let updated = self
            .retry
            .run("record_replace", |_| {
                self.records
                    .replace(student_id, attributes.clone(), expected)
            })
            .await
            .map_err(store_failure)?;

        info!(
            student_id = %student_id,
            version = updated.version,
            request_id = %ctx.request_id,
            "student updated"
        );
        self.emit(ctx, AuditEvent::updated(student_id.clone())).await;
        Ok(updated)
    }

    /// Deletes a record and emits `DELETE`. A missing record emits nothing.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record exists.
    pub async fn delete_student(&self, ctx: &RequestContext, student_id: &StudentId) -> Result<()> {
        self.retry
            .run("record_remove", |_| self.records.remove(student_id, None))
            .await
            .map_err(store_failure)?;

        info!(
            student_id = %student_id,
            request_id = %ctx.request_id,
            "student deleted"
        );
        self.emit(ctx, AuditEvent::deleted(student_id.clone())).await;
        Ok(())
    }

    /// Lists records in id order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a foreign page token.
    pub async fn list_students(&self, request: &PageRequest) -> Result<Page<StudentRecord>> {
        Ok(self.records.scan(request).await?)
    }

    /// Deletes every listed id independently.
    ///
    /// Duplicate ids are collapsed. Each id that existed emits one `DELETE`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the list is empty, too long, or holds
    /// malformed ids. Per-id failures are reported in the result instead.
    pub async fn bulk_delete_students(
        &self,
        ctx: &RequestContext,
        raw_ids: Vec<String>,
    ) -> Result<BulkDeleteReport> {
        let max = self.limits.max_bulk_delete;
        if raw_ids.is_empty() || raw_ids.len() > max {
            return Err(ValidationError::range(
                "studentIds",
                format!("between 1 and {max} ids required, got {}", raw_ids.len()),
            )
            .into());
        }

        let mut errors = ValidationErrors::new();
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(raw_ids.len());
        for (index, raw) in raw_ids.into_iter().enumerate() {
            match StudentId::parse(raw) {
                Ok(id) => {
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
                Err(mut e) => {
                    e.field = format!("studentIds[{index}]");
                    errors.add(e);
                }
            }
        }
        errors.into_result()?;

        let mut report = BulkDeleteReport::default();
        for id in ids {
            match self.delete_student(ctx, &id).await {
                Ok(()) => report.deleted.push(id),
                Err(ServiceError::NotFound { .. }) => report.not_found.push(id),
                Err(e) => report.failed.push(BulkDeleteFailure {
                    student_id: id,
                    error: e.kind().to_string(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            deleted = report.deleted.len(),
            not_found = report.not_found.len(),
            failed = report.failed.len(),
            request_id = %ctx.request_id,
            "bulk delete finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmitterConfig;
    use roster_audit::{AuditAction, DeadLetterRouter};
    use roster_core::InMemoryRecordStore;
    use roster_queue::{InMemoryQueue, MessageQueue, QueueConfig};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        service: StudentService,
        queue: Arc<InMemoryQueue<AuditEvent>>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(InMemoryQueue::new(QueueConfig::default()));
        let emitter = AuditEmitter::new(
            queue.clone(),
            EmitterConfig::default(),
            DeadLetterRouter::new(),
        );
        let service = StudentService::new(
            Arc::new(InMemoryRecordStore::new()),
            emitter,
            ServiceLimits::default(),
            RetryPolicy::default(),
        );
        Fixture { service, queue }
    }

    impl Fixture {
        async fn events(&self) -> Vec<AuditEvent> {
            assert!(self.service.emitter().drain(Duration::from_secs(5)).await);
            self.queue
                .receive(10, Duration::ZERO)
                .await
                .unwrap()
                .into_iter()
                .map(|delivery| delivery.body)
                .collect()
        }
    }

    fn id(raw: &str) -> StudentId {
        StudentId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let fx = fixture();
        let ctx = RequestContext::new("req-1");

        let created = fx
            .service
            .create_student(&ctx, json!({ "name": "Asha" }))
            .await
            .unwrap();
        let fetched = fx.service.get_student(&created.student_id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.attributes["name"], "Asha");

        let events = fx.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::Create);
        assert_eq!(events[0].student_id, created.student_id);
        assert_eq!(events[0].request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_create_rejects_non_object_and_reserved_key() {
        let fx = fixture();
        let ctx = RequestContext::generate();

        let err = fx.service.create_student(&ctx, json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = fx
            .service
            .create_student(&ctx, json!({ "studentId": "S9" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(fx.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let fx = fixture();
        let ctx = RequestContext::generate();
        let created = fx
            .service
            .create_student(&ctx, json!({ "name": "Asha" }))
            .await
            .unwrap();
        let sid = created.student_id.clone();

        let first = fx
            .service
            .update_student(&ctx, &sid, json!({ "name": "Asha K" }), Some(1))
            .await
            .unwrap();
        assert_eq!(first.version, 2);

        let err = fx
            .service
            .update_student(&ctx, &sid, json!({ "name": "Asha R" }), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let actions: Vec<_> = fx.events().await.into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Create, AuditAction::Update]);
    }

    #[tokio::test]
    async fn test_update_without_version_uses_current() {
        let fx = fixture();
        let ctx = RequestContext::generate();
        let created = fx
            .service
            .create_student(&ctx, json!({ "year": 1 }))
            .await
            .unwrap();

        let updated = fx
            .service
            .update_student(&ctx, &created.student_id, json!({ "year": 2 }), None)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.attributes["year"], 2);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let fx = fixture();
        let err = fx
            .service
            .update_student(&RequestContext::generate(), &id("ghost"), json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_emits_nothing() {
        let fx = fixture();
        let err = fx
            .service
            .delete_student(&RequestContext::generate(), &id("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(fx.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_delete_reports_each_id() {
        let fx = fixture();
        let ctx = RequestContext::generate();
        let a = fx.service.create_student(&ctx, json!({})).await.unwrap();
        let b = fx.service.create_student(&ctx, json!({})).await.unwrap();
        fx.events().await;

        let report = fx
            .service
            .bulk_delete_students(
                &ctx,
                vec![
                    a.student_id.to_string(),
                    "ghost".to_string(),
                    b.student_id.to_string(),
                    a.student_id.to_string(),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![a.student_id, b.student_id]);
        assert_eq!(report.not_found, vec![id("ghost")]);
        assert!(report.failed.is_empty());

        let events = fx.events().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == AuditAction::Delete));
    }

    #[tokio::test]
    async fn test_bulk_delete_validates_input() {
        let fx = fixture();
        let ctx = RequestContext::generate();

        let err = fx.service.bulk_delete_students(&ctx, vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let too_many = (0..26).map(|i| format!("S{i}")).collect();
        let err = fx
            .service
            .bulk_delete_students(&ctx, too_many)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = fx
            .service
            .bulk_delete_students(&ctx, vec!["ok".to_string(), "a/b".to_string()])
            .await
            .unwrap_err();
        match err {
            ServiceError::Validation(errors) => {
                assert_eq!(errors.iter().next().unwrap().field, "studentIds[1]");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_students_paginates() {
        let fx = fixture();
        let ctx = RequestContext::generate();
        for _ in 0..3 {
            fx.service.create_student(&ctx, json!({})).await.unwrap();
        }

        let request = PageRequest::new(Some(2), None).unwrap();
        let first = fx.service.list_students(&request).await.unwrap();
        assert_eq!(first.items.len(), 2);

        let token = first.next_token.unwrap();
        let second = fx.service.list_students(&request.after(token)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_token.is_none());
    }
}

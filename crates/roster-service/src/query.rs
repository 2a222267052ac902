//! Read path over the audit store.

use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use roster_audit::{AuditFilter, AuditLogEntry, AuditStore};
use roster_core::{Page, PageRequest, PageToken, Validate};

use crate::error::{Result, ServiceError};

/// Lists audit entries. Never touches the queue.
#[derive(Clone)]
pub struct AuditQuery {
    store: Arc<dyn AuditStore>,
}

impl std::fmt::Debug for AuditQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditQuery").finish_non_exhaustive()
    }
}

enum Cursor {
    Start,
    After(PageToken),
    Done,
}

impl AuditQuery {
    /// Creates a query over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Returns one page of entries ordered by `(timestamp, auditId)`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the time window is inverted or the
    /// token is foreign.
    pub async fn list_audit_entries(
        &self,
        filter: &AuditFilter,
        request: &PageRequest,
    ) -> Result<Page<AuditLogEntry>> {
        filter.validate()?;
        Ok(self.store.query(filter, request).await?)
    }

    /// Streams every matching entry, fetching pages of `page_size` lazily.
    ///
    /// An error ends the stream after being yielded.
    pub fn stream(
        &self,
        filter: AuditFilter,
        page_size: usize,
    ) -> impl Stream<Item = Result<AuditLogEntry>> + Send + 'static {
        let query = self.clone();
        let first = PageRequest::new(Some(page_size), None).map_err(ServiceError::from);

        stream::unfold(Cursor::Start, move |cursor| {
            let query = query.clone();
            let filter = filter.clone();
            let first = first.clone();
            async move {
                let request = match (cursor, first) {
                    (Cursor::Done, _) => return None,
                    (_, Err(e)) => return Some((Err(e), Cursor::Done)),
                    (Cursor::Start, Ok(request)) => request,
                    (Cursor::After(token), Ok(request)) => request.after(token),
                };
                match query.list_audit_entries(&filter, &request).await {
                    Ok(page) => {
                        let next = page.next_token.map_or(Cursor::Done, Cursor::After);
                        Some((Ok(page.items), next))
                    }
                    Err(e) => Some((Err(e), Cursor::Done)),
                }
            }
        })
        .flat_map(|page| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use roster_audit::{AuditEvent, InMemoryAuditStore};
    use roster_core::StudentId;

    async fn seeded(count: i64) -> (AuditQuery, StudentId) {
        let store = Arc::new(InMemoryAuditStore::new());
        let student = StudentId::parse("S1").unwrap();
        let base = Utc::now();
        for i in 0..count {
            let mut event = AuditEvent::updated(student.clone());
            event.timestamp = base + Duration::milliseconds(i);
            store.upsert(AuditLogEntry::ingest(event)).await.unwrap();
        }
        store
            .upsert(AuditLogEntry::ingest(AuditEvent::created(
                StudentId::parse("S2").unwrap(),
            )))
            .await
            .unwrap();
        (AuditQuery::new(store), student)
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected() {
        let (query, _) = seeded(0).await;
        let now = Utc::now();
        let filter = AuditFilter::all().between(Some(now), Some(now - Duration::seconds(1)));

        let err = query
            .list_audit_entries(&filter, &PageRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stream_walks_all_pages() {
        let (query, student) = seeded(7).await;

        let entries: Vec<_> = query
            .stream(AuditFilter::for_student(student.clone()), 3)
            .collect()
            .await;

        assert_eq!(entries.len(), 7);
        let entries: Vec<AuditLogEntry> = entries.into_iter().map(|e| e.unwrap()).collect();
        assert!(entries.iter().all(|e| e.event.student_id == student));
        assert!(entries
            .windows(2)
            .all(|w| w[0].event.timestamp <= w[1].event.timestamp));
    }

    #[tokio::test]
    async fn test_stream_yields_error_once() {
        let (query, _) = seeded(1).await;
        let errors: Vec<_> = query.stream(AuditFilter::all(), 0).collect().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_err());
    }
}

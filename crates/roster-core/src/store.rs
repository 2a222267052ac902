//! Record store abstraction and its in-memory implementation.
//!
//! All writes are single-key and conditional: inserts fail when the key
//! exists, replacements and removals can be pinned to a version. This is the
//! only serialization point for concurrent mutations of one student.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::page::{Page, PageRequest, PageToken};
use crate::student::{Attributes, StudentId, StudentRecord};

/// Keyed storage of student records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record; fails with [`StoreError::AlreadyExists`] if the key is taken.
    async fn insert(&self, record: StudentRecord) -> StoreResult<StudentRecord>;

    /// Fetches a record by key.
    async fn get(&self, student_id: &StudentId) -> StoreResult<Option<StudentRecord>>;

    /// Replaces the attributes of a record if its version still equals `expected_version`.
    async fn replace(
        &self,
        student_id: &StudentId,
        attributes: Attributes,
        expected_version: u64,
    ) -> StoreResult<StudentRecord>;

    /// Removes a record, optionally only if it is still at `expected_version`.
    ///
    /// Returns the removed record.
    async fn remove(
        &self,
        student_id: &StudentId,
        expected_version: Option<u64>,
    ) -> StoreResult<StudentRecord>;

    /// Returns one page of records in key order.
    async fn scan(&self, request: &PageRequest) -> StoreResult<Page<StudentRecord>>;
}

/// In-memory record store ordered by student id.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<StudentId, StudentRecord>>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no records are stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn not_found(student_id: &StudentId) -> StoreError {
    StoreError::NotFound {
        student_id: student_id.to_string(),
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: StudentRecord) -> StoreResult<StudentRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.student_id) {
            return Err(StoreError::AlreadyExists {
                student_id: record.student_id.to_string(),
            });
        }
        records.insert(record.student_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, student_id: &StudentId) -> StoreResult<Option<StudentRecord>> {
        Ok(self.records.read().await.get(student_id).cloned())
    }

    async fn replace(
        &self,
        student_id: &StudentId,
        attributes: Attributes,
        expected_version: u64,
    ) -> StoreResult<StudentRecord> {
        let mut records = self.records.write().await;
        let current = records.get(student_id).ok_or_else(|| not_found(student_id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                student_id: student_id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let next = current.next_version(attributes);
        records.insert(student_id.clone(), next.clone());
        Ok(next)
    }

    async fn remove(
        &self,
        student_id: &StudentId,
        expected_version: Option<u64>,
    ) -> StoreResult<StudentRecord> {
        let mut records = self.records.write().await;
        let current = records.get(student_id).ok_or_else(|| not_found(student_id))?;
        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(StoreError::VersionConflict {
                    student_id: student_id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }
        records.remove(student_id).ok_or_else(|| not_found(student_id))
    }

    async fn scan(&self, request: &PageRequest) -> StoreResult<Page<StudentRecord>> {
        let start = match &request.token {
            Some(token) => Bound::Excluded(StudentId::parse(token.as_str()).map_err(|e| {
                StoreError::InvalidPageToken {
                    reason: e.message,
                }
            })?),
            None => Bound::Unbounded,
        };

        let records = self.records.read().await;
        let mut range = records.range((start, Bound::Unbounded));
        let items: Vec<StudentRecord> = range
            .by_ref()
            .take(request.limit)
            .map(|(_, record)| record.clone())
            .collect();

        let next_token = if range.next().is_some() {
            items
                .last()
                .map(|record| PageToken::new(record.student_id.as_str()))
        } else {
            None
        };

        tracing::trace!(returned = items.len(), more = next_token.is_some(), "scanned records");
        Ok(Page::new(items, next_token))
    }
}

//! Audit store abstraction and its in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use roster_core::{Page, PageRequest, PageToken};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AuditStoreError, AuditStoreResult};
use crate::event::{AuditFilter, AuditLogEntry};

/// What an upsert did to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entry existed for the audit id.
    Inserted,
    /// An identical event was already stored; nothing changed.
    Unchanged,
    /// An entry existed with different event content and was overwritten.
    Overwritten,
}

/// Durable, append-mostly storage of audit entries keyed by audit id.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Writes `entry` under its audit id.
    ///
    /// Applying the same entry any number of times leaves one stored entry.
    /// The `ingested_at` of the first write is kept.
    async fn upsert(&self, entry: AuditLogEntry) -> AuditStoreResult<UpsertOutcome>;

    /// Fetches one entry.
    async fn get(&self, audit_id: Uuid) -> AuditStoreResult<Option<AuditLogEntry>>;

    /// Returns one page of entries matching `filter`, ordered by
    /// `(timestamp, audit_id)`.
    async fn query(
        &self,
        filter: &AuditFilter,
        request: &PageRequest,
    ) -> AuditStoreResult<Page<AuditLogEntry>>;
}

/// Position of an entry in query order.
type SortKey = (DateTime<Utc>, Uuid);

fn sort_key(entry: &AuditLogEntry) -> SortKey {
    (entry.event.timestamp, entry.event.audit_id)
}

fn encode_token(key: &SortKey) -> PageToken {
    PageToken::new(format!(
        "{}_{}",
        key.0.to_rfc3339_opts(SecondsFormat::Nanos, true),
        key.1
    ))
}

fn decode_token(token: &PageToken) -> AuditStoreResult<SortKey> {
    let invalid = |reason: &str| AuditStoreError::InvalidPageToken {
        reason: reason.to_string(),
    };
    let (timestamp, audit_id) = token
        .as_str()
        .split_once('_')
        .ok_or_else(|| invalid("missing separator"))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| invalid("bad timestamp"))?
        .with_timezone(&Utc);
    let audit_id = Uuid::parse_str(audit_id).map_err(|_| invalid("bad audit id"))?;
    Ok((timestamp, audit_id))
}

/// In-memory audit store.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    entries: RwLock<HashMap<Uuid, AuditLogEntry>>,
}

impl InMemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn upsert(&self, entry: AuditLogEntry) -> AuditStoreResult<UpsertOutcome> {
        let mut entries = self.entries.write().await;
        let outcome = match entries.get(&entry.audit_id()) {
            None => {
                entries.insert(entry.audit_id(), entry);
                UpsertOutcome::Inserted
            }
            Some(existing) if existing.event == entry.event => UpsertOutcome::Unchanged,
            Some(existing) => {
                let replacement = AuditLogEntry::ingest_at(entry.event, existing.ingested_at);
                entries.insert(replacement.audit_id(), replacement);
                UpsertOutcome::Overwritten
            }
        };
        Ok(outcome)
    }

    async fn get(&self, audit_id: Uuid) -> AuditStoreResult<Option<AuditLogEntry>> {
        Ok(self.entries.read().await.get(&audit_id).cloned())
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        request: &PageRequest,
    ) -> AuditStoreResult<Page<AuditLogEntry>> {
        let after = request.token.as_ref().map(decode_token).transpose()?;

        let entries = self.entries.read().await;
        let mut matching: Vec<&AuditLogEntry> = entries
            .values()
            .filter(|entry| filter.matches(entry))
            .filter(|entry| after.is_none_or(|key| sort_key(entry) > key))
            .collect();
        matching.sort_by_key(|entry| sort_key(entry));

        let has_more = matching.len() > request.limit;
        let items: Vec<AuditLogEntry> = matching
            .into_iter()
            .take(request.limit)
            .cloned()
            .collect();
        let next_token = if has_more {
            items.last().map(|entry| encode_token(&sort_key(entry)))
        } else {
            None
        };
        Ok(Page::new(items, next_token))
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, TransactionRecord};
use tokio::sync::RwLock;

use crate::{NotificationLog, NotificationMarker, RecordStore, Result, StaleQuery, StoreError};

/// In-memory record store for testing and single-process deployments.
///
/// Conditional updates hold the write lock across the version check and the
/// write, giving the same compare-and-swap semantics as the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<(RecordKind, RecordId), TransactionRecord>>>,
}

impl InMemoryRecordStore {
    /// Creates a new empty in-memory record store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_reference(record: &TransactionRecord, reference: &str) -> bool {
    match record {
        TransactionRecord::Payment(p) => p.provider_reference.as_deref() == Some(reference),
        TransactionRecord::Payout(p) => p.has_used_reference(reference),
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: TransactionRecord) -> Result<()> {
        let key = (record.kind(), record.id());
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(StoreError::Duplicate {
                kind: key.0,
                record_id: key.1,
            });
        }
        records.insert(key, record);
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<TransactionRecord>> {
        Ok(self.records.read().await.get(&(kind, id)).cloned())
    }

    async fn find_by_reference(
        &self,
        kind: RecordKind,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<TransactionRecord>> {
        let records = self.records.read().await;
        let mut candidates: Vec<&TransactionRecord> = records
            .values()
            .filter(|r| r.kind() == kind && r.provider() == provider)
            .filter(|r| matches_reference(r, reference))
            .collect();

        // a current reference wins over one superseded by a retry
        candidates.sort_by_key(|r| r.provider_reference() != Some(reference));
        Ok(candidates.first().map(|r| (*r).clone()))
    }

    async fn find_stale(&self, query: StaleQuery) -> Result<Vec<TransactionRecord>> {
        let records = self.records.read().await;
        let mut stale: Vec<TransactionRecord> = records
            .values()
            .filter(|r| r.kind() == query.kind && r.status().is_in_flight())
            .filter(|r| query.provider.is_none_or(|p| r.provider() == p))
            .filter(|r| r.staleness_anchor() < query.cutoff)
            .cloned()
            .collect();

        stale.sort_by(|a, b| {
            a.staleness_anchor()
                .cmp(&b.staleness_anchor())
                .then(a.id().cmp(&b.id()))
        });

        if let Some(limit) = query.limit {
            stale.truncate(limit);
        }
        Ok(stale)
    }

    async fn update(&self, record: &TransactionRecord, expected_version: i64) -> Result<i64> {
        let key = (record.kind(), record.id());
        let mut records = self.records.write().await;

        let stored = records.get(&key).ok_or(StoreError::NotFound {
            kind: key.0,
            record_id: key.1,
        })?;

        if stored.version() != expected_version {
            metrics::counter!("store_conflicts_total", "kind" => key.0.as_str()).increment(1);
            return Err(StoreError::Conflict {
                kind: key.0,
                record_id: key.1,
                expected: expected_version,
                actual: stored.version(),
            });
        }

        let last_checked_at = stored.last_checked_at().max(record.last_checked_at());
        let new_version = expected_version + 1;

        let mut updated = record.clone();
        updated.set_version(new_version);
        updated.set_last_checked_at(last_checked_at);
        records.insert(key, updated);

        Ok(new_version)
    }

    async fn mark_checked(&self, kind: RecordKind, id: RecordId, at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&(kind, id)).ok_or(StoreError::NotFound {
            kind,
            record_id: id,
        })?;
        let checked = record.last_checked_at().max(Some(at));
        record.set_last_checked_at(checked);
        Ok(())
    }
}

/// In-memory notification dedup ledger.
#[derive(Clone, Default)]
pub struct InMemoryNotificationLog {
    markers: Arc<RwLock<HashMap<(RecordId, CanonicalStatus), NotificationMarker>>>,
}

impl InMemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of markers recorded.
    pub async fn marker_count(&self) -> usize {
        self.markers.read().await.len()
    }
}

#[async_trait]
impl NotificationLog for InMemoryNotificationLog {
    async fn try_record(&self, marker: &NotificationMarker) -> Result<bool> {
        let mut markers = self.markers.write().await;
        let key = (marker.record_id, marker.status);
        if markers.contains_key(&key) {
            return Ok(false);
        }
        markers.insert(key, marker.clone());
        Ok(true)
    }

    async fn exists(&self, record_id: RecordId, status: CanonicalStatus) -> Result<bool> {
        Ok(self.markers.read().await.contains_key(&(record_id, status)))
    }

    async fn mark_delivered(
        &self,
        record_id: RecordId,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(marker) = self.markers.write().await.get_mut(&(record_id, status)) {
            marker.delivered_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn release(&self, record_id: RecordId, status: CanonicalStatus) -> Result<()> {
        if let Some(marker) = self.markers.write().await.get_mut(&(record_id, status)) {
            if !marker.is_delivered() {
                marker.claimed_until = marker.sent_at;
            }
        }
        Ok(())
    }

    async fn claim_undelivered(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMarker>> {
        let mut markers = self.markers.write().await;
        let mut due: Vec<&mut NotificationMarker> = markers
            .values_mut()
            .filter(|m| !m.is_delivered() && m.claimed_until <= now)
            .collect();
        due.sort_by_key(|m| m.sent_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|m| {
                m.claimed_until = until;
                m.clone()
            })
            .collect())
    }

    async fn markers_for(&self, record_id: RecordId) -> Result<Vec<NotificationMarker>> {
        let markers = self.markers.read().await;
        let mut found: Vec<NotificationMarker> = markers
            .values()
            .filter(|m| m.record_id == record_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.sent_at);
        Ok(found)
    }
}

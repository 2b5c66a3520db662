use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, TransactionRecord};
use serde::{Deserialize, Serialize};

use crate::{Result, StaleQuery, StoreError};

/// Durable storage for payment and payout records.
///
/// Every status-bearing write goes through [`RecordStore::update`], a
/// compare-and-swap on the record's `version`. Implementations must make that
/// check and the write a single atomic step.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record. Fails with `Duplicate` if the id is taken.
    async fn insert(&self, record: TransactionRecord) -> Result<()>;

    /// Loads a record by id.
    async fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<TransactionRecord>>;

    /// Loads the record a provider knows under `reference`.
    ///
    /// Payouts also match references that were replaced by a retry.
    async fn find_by_reference(
        &self,
        kind: RecordKind,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<TransactionRecord>>;

    /// Selects in-flight records due for a provider check, oldest first.
    async fn find_stale(&self, query: StaleQuery) -> Result<Vec<TransactionRecord>>;

    /// Persists `record` only if the stored version still equals `expected_version`.
    ///
    /// Returns the new version. `last_checked_at` is bookkeeping and is never
    /// moved backwards by this call.
    async fn update(&self, record: &TransactionRecord, expected_version: i64) -> Result<i64>;

    /// Stamps a successful provider check without touching status or version.
    async fn mark_checked(&self, kind: RecordKind, id: RecordId, at: DateTime<Utc>) -> Result<()>;
}

/// Extension trait providing convenience methods for record stores.
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    /// Loads a record that must exist.
    async fn require(&self, kind: RecordKind, id: RecordId) -> Result<TransactionRecord> {
        self.get(kind, id)
            .await?
            .ok_or(StoreError::NotFound { kind, record_id: id })
    }

    /// Writes `record` against its own version and stores the new one on it.
    async fn save(&self, record: &mut TransactionRecord) -> Result<()> {
        let expected = record.version();
        let version = self.update(record, expected).await?;
        record.set_version(version);
        Ok(())
    }
}

impl<T: RecordStore + ?Sized> RecordStoreExt for T {}

/// Durable fact that a notification is owed or went out for `(record_id, status)`.
///
/// The marker is written before dispatch. Until `delivered_at` is set it is an
/// outstanding delivery, held by whoever dispatches it until `claimed_until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMarker {
    pub record_id: RecordId,
    pub record_kind: RecordKind,
    pub status: CanonicalStatus,
    pub notification_kind: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub claimed_until: DateTime<Utc>,
}

impl NotificationMarker {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Dedup ledger consulted before every status notification.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Atomically inserts the marker unless one exists for the same
    /// `(record_id, status)`. Returns true if this call inserted it.
    async fn try_record(&self, marker: &NotificationMarker) -> Result<bool>;

    /// Returns true if a marker exists for `(record_id, status)`.
    async fn exists(&self, record_id: RecordId, status: CanonicalStatus) -> Result<bool>;

    /// Records that the notification for `(record_id, status)` was handed over.
    async fn mark_delivered(
        &self,
        record_id: RecordId,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Gives up the claim on an undelivered marker so the next pass retries it.
    async fn release(&self, record_id: RecordId, status: CanonicalStatus) -> Result<()>;

    /// Atomically claims up to `limit` undelivered markers whose claim lapsed
    /// by `now`, holding each until `until`. Oldest first.
    async fn claim_undelivered(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMarker>>;

    /// All markers recorded for a record, oldest first.
    async fn markers_for(&self, record_id: RecordId) -> Result<Vec<NotificationMarker>>;
}

//! Status notifications and the dedup gate in front of them.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::RecordKind;
use domain::{CanonicalStatus, TransactionRecord};
use record_store::{NotificationLog, NotificationMarker, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Human-facing notification sent when a record settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentCompleted,
    PaymentFailed,
    PayoutCompleted,
    PayoutFailed,
}

impl NotificationKind {
    /// The notification owed for a record of `kind` entering `status`, if any.
    pub fn for_status(kind: RecordKind, status: CanonicalStatus) -> Option<Self> {
        match (kind, status) {
            (RecordKind::Payment, CanonicalStatus::Completed) => Some(Self::PaymentCompleted),
            (RecordKind::Payment, CanonicalStatus::Failed) => Some(Self::PaymentFailed),
            (RecordKind::Payout, CanonicalStatus::Completed) => Some(Self::PayoutCompleted),
            (RecordKind::Payout, CanonicalStatus::Failed) => Some(Self::PayoutFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentCompleted => "payment_completed",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::PayoutCompleted => "payout_completed",
            NotificationKind::PayoutFailed => "payout_failed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-side failure to hand a notification over.
#[derive(Debug, Clone, Error)]
#[error("notification dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Fire-and-forget notification transport owned by another system.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), DispatchError>;
}

/// A notification handed to [`InMemoryNotificationDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub kind: NotificationKind,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct InMemoryDispatcherState {
    sent: Vec<SentNotification>,
    fail_on_send: bool,
}

/// In-memory dispatcher for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationDispatcher {
    state: Arc<RwLock<InMemoryDispatcherState>>,
}

impl InMemoryNotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the dispatcher to fail every send.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_send = fail;
    }

    /// Notifications accepted so far, in send order.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .len()
    }
}

#[async_trait]
impl NotificationDispatcher for InMemoryNotificationDispatcher {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.fail_on_send {
            return Err(DispatchError("transport unavailable".to_string()));
        }
        state.sent.push(SentNotification {
            recipient: recipient.to_string(),
            kind,
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Dispatcher that only writes a log line, for deployments without a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingNotificationDispatcher {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        payload: &Value,
    ) -> Result<(), DispatchError> {
        tracing::info!(recipient, kind = %kind, payload = %payload, "notification dispatched");
        Ok(())
    }
}

/// What the gate did about a settled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent,
    /// A marker for this (record, status) already existed.
    AlreadySent,
    /// The status is not notification-worthy or there is no recipient.
    NotApplicable,
    /// Dispatch failed; the marker stays owed for a later pass.
    Failed,
}

/// Guarantees one notification per (record, target status).
///
/// The marker is claimed with an atomic insert-if-absent before dispatch, so a
/// concurrent pass over the same transition finds it and stands down. A marker
/// whose dispatch failed stays undelivered and is picked up again by
/// [`NotificationGate::redeliver`].
#[derive(Clone)]
pub struct NotificationGate {
    log: Arc<dyn NotificationLog>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    claim_lease: Duration,
}

impl NotificationGate {
    pub fn new(log: Arc<dyn NotificationLog>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            log,
            dispatcher,
            claim_lease: Duration::minutes(5),
        }
    }

    /// How long a dispatcher holds an undelivered marker before another pass
    /// may take it over.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Sends the notification owed for the record's current status, if any.
    #[tracing::instrument(skip_all, fields(record_id = %record.id(), status = %record.status()))]
    pub async fn notify(&self, record: &TransactionRecord) -> Result<NotifyOutcome, StoreError> {
        let status = record.status();
        let Some(kind) = NotificationKind::for_status(record.kind(), status) else {
            return Ok(NotifyOutcome::NotApplicable);
        };
        let Some(recipient) = record.recipient() else {
            tracing::debug!("no recipient on record, skipping notification");
            return Ok(NotifyOutcome::NotApplicable);
        };

        let now = Utc::now();
        let marker = NotificationMarker {
            record_id: record.id(),
            record_kind: record.kind(),
            status,
            notification_kind: kind.as_str().to_string(),
            recipient: recipient.to_string(),
            sent_at: now,
            delivered_at: None,
            claimed_until: now + self.claim_lease,
        };
        if !self.log.try_record(&marker).await? {
            metrics::counter!("notifications_suppressed_total", "kind" => kind.as_str())
                .increment(1);
            tracing::debug!(kind = %kind, "notification already sent");
            return Ok(NotifyOutcome::AlreadySent);
        }

        if self.dispatch(record, &marker, kind).await {
            Ok(NotifyOutcome::Sent)
        } else {
            Ok(NotifyOutcome::Failed)
        }
    }

    /// Retries notifications whose earlier dispatch failed. Returns how many
    /// went out.
    #[tracing::instrument(skip_all)]
    pub async fn redeliver(
        &self,
        store: &dyn RecordStore,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let owed = self
            .log
            .claim_undelivered(now, now + self.claim_lease, limit)
            .await?;

        let mut delivered = 0;
        for marker in owed {
            let kind = NotificationKind::for_status(marker.record_kind, marker.status);
            let record = store.get(marker.record_kind, marker.record_id).await?;
            let (Some(kind), Some(record)) = (kind, record) else {
                tracing::warn!(record_id = %marker.record_id, status = %marker.status, "dropping owed notification without a record");
                self.log
                    .mark_delivered(marker.record_id, marker.status, now)
                    .await?;
                continue;
            };

            if self.dispatch(&record, &marker, kind).await {
                metrics::counter!("notifications_redelivered_total", "kind" => kind.as_str())
                    .increment(1);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Hands the notification to the transport and settles the marker.
    async fn dispatch(
        &self,
        record: &TransactionRecord,
        marker: &NotificationMarker,
        kind: NotificationKind,
    ) -> bool {
        let mut payload = notification_payload(record);
        payload["status"] = json!(marker.status);

        if let Err(e) = self.dispatcher.send(&marker.recipient, kind, &payload).await {
            tracing::warn!(kind = %kind, error = %e, "notification dispatch failed");
            if let Err(release) = self.log.release(marker.record_id, marker.status).await {
                tracing::error!(error = %release, "failed to release notification marker");
            }
            return false;
        }

        metrics::counter!("notifications_dispatched_total", "kind" => kind.as_str()).increment(1);
        if let Err(e) = self
            .log
            .mark_delivered(marker.record_id, marker.status, Utc::now())
            .await
        {
            // the claim lapses and the notification goes out again
            tracing::error!(error = %e, "failed to mark notification delivered");
        }
        true
    }
}

/// Payload carried by a status notification.
pub fn notification_payload(record: &TransactionRecord) -> Value {
    let mut payload = json!({
        "recordId": record.id(),
        "kind": record.kind().as_str(),
        "status": record.status(),
        "amount": record.amount(),
        "currency": record.currency(),
        "bookingId": record.booking_id(),
        "reference": record.provider_reference(),
    });
    if let Some(payout) = record.as_payout() {
        payload["retryCount"] = json!(payout.retry_count);
        payload["maxRetriesReached"] = json!(payout.max_retries_reached);
    }
    if let Some(error) = record.error_message() {
        payload["error"] = json!(error);
    }
    payload
}

//! Transactional core: applies status changes and triggers notifications.

use std::sync::Arc;

use chrono::Utc;
use domain::{CanonicalStatus, TransactionRecord};
use record_store::{RecordStore, RecordStoreExt};
use serde_json::Value;

use crate::error::{ReconcileError, Result};
use crate::notification::{NotificationGate, NotifyOutcome};

/// Metadata key holding the latest raw provider answer.
pub const LAST_PROVIDER_RESPONSE: &str = "last_provider_response";

/// Extra facts persisted together with a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusContext {
    pub provider_response: Option<Value>,
    /// Written only when the record has no reference yet.
    pub reference: Option<String>,
    pub error_message: Option<String>,
    /// Payouts only: marks a failure caused by exhausted retries.
    pub max_retries_reached: bool,
}

impl StatusContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider_response(mut self, response: Value) -> Self {
        self.provider_response = Some(response);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn max_retries_reached(mut self) -> Self {
        self.max_retries_reached = true;
        self
    }
}

/// Result of [`OrchestrationService::apply_status_change`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The stored record already had the target status. Nothing was written.
    Unchanged { record: TransactionRecord },
    /// The status change was persisted.
    Applied {
        from: CanonicalStatus,
        record: TransactionRecord,
        notification: NotifyOutcome,
    },
}

impl ApplyOutcome {
    /// The record as stored after the call.
    pub fn record(&self) -> &TransactionRecord {
        match self {
            ApplyOutcome::Unchanged { record } | ApplyOutcome::Applied { record, .. } => record,
        }
    }

    pub fn into_record(self) -> TransactionRecord {
        match self {
            ApplyOutcome::Unchanged { record } | ApplyOutcome::Applied { record, .. } => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Single entry point for status writes.
///
/// Every write is a compare-and-swap on the record version. A lost race is
/// retried once against a fresh read; a fresh read that already shows the
/// target status is a successful no-op.
#[derive(Clone)]
pub struct OrchestrationService {
    store: Arc<dyn RecordStore>,
    gate: NotificationGate,
}

impl OrchestrationService {
    pub fn new(store: Arc<dyn RecordStore>, gate: NotificationGate) -> Self {
        Self { store, gate }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn gate(&self) -> &NotificationGate {
        &self.gate
    }

    /// Moves `record` to `target`, persisting `context` in the same write.
    #[tracing::instrument(
        skip(self, record, context),
        fields(record_id = %record.id(), kind = %record.kind(), provider = %record.provider(), to = %target)
    )]
    pub async fn apply_status_change(
        &self,
        record: &TransactionRecord,
        target: CanonicalStatus,
        context: StatusContext,
    ) -> Result<ApplyOutcome> {
        let mut current = record.clone();

        for attempt in 0..2 {
            if current.status() == target {
                return Ok(ApplyOutcome::Unchanged { record: current });
            }

            let from = current.status();
            let mut next = current.clone();
            if next.transition_to(target).is_err() {
                tracing::error!(from = %from, "rejected invalid status transition");
                return Err(ReconcileError::InvalidTransition {
                    kind: current.kind(),
                    record_id: current.id(),
                    from,
                    to: target,
                });
            }
            apply_context(&mut next, &context);

            match self.store.save(&mut next).await.map_err(ReconcileError::from) {
                Ok(()) => {
                    metrics::counter!(
                        "status_transitions_total",
                        "kind" => next.kind().as_str(),
                        "from" => from.as_str(),
                        "to" => target.as_str()
                    )
                    .increment(1);
                    tracing::info!(from = %from, version = next.version(), "status changed");

                    let notification = self.gate.notify(&next).await.unwrap_or_else(|e| {
                        tracing::error!(error = %e, "notification gate failed");
                        NotifyOutcome::Failed
                    });
                    return Ok(ApplyOutcome::Applied {
                        from,
                        record: next,
                        notification,
                    });
                }
                Err(ReconcileError::StoreConflict { .. }) if attempt == 0 => {
                    tracing::debug!("version conflict, retrying against a fresh read");
                    current = self.store.require(current.kind(), current.id()).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ReconcileError::StoreConflict {
            kind: record.kind(),
            record_id: record.id(),
        })
    }
}

fn apply_context(record: &mut TransactionRecord, context: &StatusContext) {
    let now = Utc::now();

    if let Some(response) = &context.provider_response {
        record
            .metadata_mut()
            .insert(LAST_PROVIDER_RESPONSE.to_string(), response.clone());
    }
    if let Some(reference) = &context.reference {
        if record.provider_reference().is_none() {
            // cannot fail: the record has no reference to conflict with
            let _ = record.assign_reference(reference);
        }
    }
    if let Some(message) = &context.error_message {
        record.set_error_message(Some(message.clone()));
    }
    if context.max_retries_reached {
        if let Some(payout) = record.as_payout_mut() {
            payout.max_retries_reached = true;
        }
    }
    record.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ProviderId, RecordId, RecordKind};
    use domain::{Payment, Payout};
    use record_store::{InMemoryNotificationLog, InMemoryRecordStore};
    use serde_json::json;

    use crate::notification::InMemoryNotificationDispatcher;

    struct Fixture {
        service: OrchestrationService,
        store: InMemoryRecordStore,
        dispatcher: InMemoryNotificationDispatcher,
    }

    fn fixture() -> Fixture {
        let store = InMemoryRecordStore::new();
        let dispatcher = InMemoryNotificationDispatcher::new();
        let gate = NotificationGate::new(
            Arc::new(InMemoryNotificationLog::new()),
            Arc::new(dispatcher.clone()),
        );
        Fixture {
            service: OrchestrationService::new(Arc::new(store.clone()), gate),
            store,
            dispatcher,
        }
    }

    async fn processing_payment(store: &InMemoryRecordStore) -> TransactionRecord {
        let record: TransactionRecord = Payment::new(ProviderId::MtnMomo, 15000, "UGX", "booking-1")
            .with_payer("user-1")
            .with_reference("ref-1")
            .with_status(CanonicalStatus::Processing)
            .into();
        store.insert(record.clone()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_apply_twice_writes_and_notifies_once() {
        let f = fixture();
        let record = processing_payment(&f.store).await;

        let first = f
            .service
            .apply_status_change(&record, CanonicalStatus::Completed, StatusContext::new())
            .await
            .unwrap();
        assert!(matches!(
            first,
            ApplyOutcome::Applied {
                from: CanonicalStatus::Processing,
                notification: NotifyOutcome::Sent,
                ..
            }
        ));

        let second = f
            .service
            .apply_status_change(first.record(), CanonicalStatus::Completed, StatusContext::new())
            .await
            .unwrap();
        assert!(matches!(second, ApplyOutcome::Unchanged { .. }));

        let stored = f.store.require(RecordKind::Payment, record.id()).await.unwrap();
        assert_eq!(stored.version(), 1);
        assert_eq!(f.dispatcher.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_copy_converges_after_conflict() {
        let f = fixture();
        let record = processing_payment(&f.store).await;

        f.service
            .apply_status_change(&record, CanonicalStatus::Completed, StatusContext::new())
            .await
            .unwrap();
        // same stale snapshot, as seen by an overlapping sweep
        let again = f
            .service
            .apply_status_change(&record, CanonicalStatus::Completed, StatusContext::new())
            .await
            .unwrap();

        assert!(matches!(again, ApplyOutcome::Unchanged { .. }));
        assert_eq!(again.record().version(), 1);
        assert_eq!(f.dispatcher.sent_count(), 1);
    }

    #[test]
    fn test_retried_conflict_is_counted_once() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let f = fixture();
                let record = processing_payment(&f.store).await;
                for _ in 0..2 {
                    f.service
                        .apply_status_change(&record, CanonicalStatus::Completed, StatusContext::new())
                        .await
                        .unwrap();
                }
            })
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"store_conflicts_total{kind="payment"} 1"#), "{rendered}");
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_record_untouched() {
        let f = fixture();
        let record = processing_payment(&f.store).await;

        for target in [CanonicalStatus::Pending, CanonicalStatus::Refunded] {
            let err = f
                .service
                .apply_status_change(&record, target, StatusContext::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ReconcileError::InvalidTransition { to, .. } if to == target));
        }

        let stored = f.store.require(RecordKind::Payment, record.id()).await.unwrap();
        assert_eq!(stored, record);
        assert_eq!(f.dispatcher.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_record_rejects_other_terminal_status() {
        let f = fixture();
        let record = processing_payment(&f.store).await;
        let done = f
            .service
            .apply_status_change(&record, CanonicalStatus::Failed, StatusContext::new())
            .await
            .unwrap()
            .into_record();

        let err = f
            .service
            .apply_status_change(&done, CanonicalStatus::Completed, StatusContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_context_is_persisted_with_status() {
        let f = fixture();
        let record: TransactionRecord = Payment::new(ProviderId::AirtelMoney, 500, "KES", "b-9")
            .with_payer("user-9")
            .into();
        f.store.insert(record.clone()).await.unwrap();

        let context = StatusContext::new()
            .with_provider_response(json!({"status": "TF"}))
            .with_reference("tx-77")
            .with_error("provider reported failure");
        let outcome = f
            .service
            .apply_status_change(&record, CanonicalStatus::Failed, context)
            .await
            .unwrap();

        let stored = f.store.require(RecordKind::Payment, record.id()).await.unwrap();
        assert_eq!(&stored, outcome.record());
        assert_eq!(stored.provider_reference(), Some("tx-77"));
        assert_eq!(stored.error_message(), Some("provider reported failure"));
        let TransactionRecord::Payment(payment) = stored else {
            panic!("expected payment");
        };
        assert_eq!(payment.metadata[LAST_PROVIDER_RESPONSE]["status"], "TF");
    }

    #[tokio::test]
    async fn test_context_reference_never_replaces_existing_one() {
        let f = fixture();
        let record = processing_payment(&f.store).await;

        let outcome = f
            .service
            .apply_status_change(
                &record,
                CanonicalStatus::Completed,
                StatusContext::new().with_reference("other-ref"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.record().provider_reference(), Some("ref-1"));
    }

    #[tokio::test]
    async fn test_exhausted_marker_on_payout() {
        let f = fixture();
        let record: TransactionRecord = Payout::new(
            ProviderId::MtnMomo,
            RecordId::new(),
            4000,
            "UGX",
            "256770000001",
            "booking-1",
            "driver-1",
        )
        .with_reference("ref-0")
        .with_status(CanonicalStatus::Processing)
        .into();
        f.store.insert(record.clone()).await.unwrap();

        let outcome = f
            .service
            .apply_status_change(
                &record,
                CanonicalStatus::Failed,
                StatusContext::new().max_retries_reached(),
            )
            .await
            .unwrap();

        assert!(outcome.record().as_payout().unwrap().max_retries_reached);
        assert_eq!(f.dispatcher.sent()[0].payload["maxRetriesReached"], true);
    }
}

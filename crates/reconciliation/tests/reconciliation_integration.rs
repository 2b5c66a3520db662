//! Integration tests for sweeps, payout retries and on-demand checks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, Payment, Payout, RetryPolicy, TransactionRecord};
use providers::{
    InMemoryProviderAdapter, InitiateOutcome, InitiateRequest, PaymentCheck, PayoutCheck,
    ProviderAdapter, ProviderRegistry, ProviderResult,
};
use reconciliation::{
    InMemoryNotificationDispatcher, NotificationGate, NotificationKind, OnDemandStatus,
    ReconcileConfig, ReconcileError, ReconciliationScheduler, Reconciler, RecordOutcome,
    StatusRequest,
};
use record_store::{InMemoryNotificationLog, InMemoryRecordStore, RecordStore, RecordStoreExt};

struct TestHarness {
    store: InMemoryRecordStore,
    dispatcher: InMemoryNotificationDispatcher,
    mtn: InMemoryProviderAdapter,
    airtel: InMemoryProviderAdapter,
    reconciler: Arc<Reconciler>,
    scheduler: ReconciliationScheduler,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(ReconcileConfig::default())
    }

    fn with_config(config: ReconcileConfig) -> Self {
        let store = InMemoryRecordStore::new();
        let dispatcher = InMemoryNotificationDispatcher::new();
        let mtn = InMemoryProviderAdapter::new(ProviderId::MtnMomo);
        let airtel = InMemoryProviderAdapter::new(ProviderId::AirtelMoney);

        let gate = NotificationGate::new(
            Arc::new(InMemoryNotificationLog::new()),
            Arc::new(dispatcher.clone()),
        );
        let registry = ProviderRegistry::new()
            .with(Arc::new(mtn.clone()))
            .with(Arc::new(airtel.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(store.clone()),
            gate,
            registry,
            config,
        ));
        let scheduler = ReconciliationScheduler::new(reconciler.clone());

        Self {
            store,
            dispatcher,
            mtn,
            airtel,
            reconciler,
            scheduler,
        }
    }

    async fn add_payment(
        &self,
        provider: ProviderId,
        reference: Option<&str>,
        status: CanonicalStatus,
    ) -> TransactionRecord {
        let mut payment = Payment::new(provider, 15000, "UGX", "booking-1")
            .with_payer("user-1")
            .with_status(status)
            .created_at(Utc::now() - ChronoDuration::minutes(10));
        if let Some(reference) = reference {
            payment = payment.with_reference(reference);
        }
        let record: TransactionRecord = payment.into();
        self.store.insert(record.clone()).await.unwrap();
        record
    }

    async fn add_payout(&self, reference: &str, configure: impl FnOnce(&mut Payout)) -> TransactionRecord {
        let mut payout = Payout::new(
            ProviderId::MtnMomo,
            RecordId::new(),
            4000,
            "UGX",
            "256770000001",
            "booking-1",
            "driver-1",
        )
        .with_reference(reference)
        .with_status(CanonicalStatus::Processing)
        .created_at(Utc::now() - ChronoDuration::minutes(10));
        configure(&mut payout);
        let record: TransactionRecord = payout.into();
        self.store.insert(record.clone()).await.unwrap();
        record
    }

    async fn load(&self, record: &TransactionRecord) -> TransactionRecord {
        self.store.require(record.kind(), record.id()).await.unwrap()
    }
}

#[tokio::test]
async fn test_sweep_completes_processing_payment_and_notifies_once() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.checked, 1);
    assert_eq!(report.payments.results[0].outcome, RecordOutcome::Updated);
    assert_eq!(report.payments.results[0].status, CanonicalStatus::Completed);
    assert_eq!(report.payouts.checked, 0);

    let stored = h.load(&record).await;
    assert_eq!(stored.status(), CanonicalStatus::Completed);
    assert!(stored.last_checked_at().is_some());

    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::PaymentCompleted);
    assert_eq!(sent[0].recipient, "user-1");

    // terminal now, nothing left to sweep
    let again = h.scheduler.run_sweep().await.unwrap();
    assert_eq!(again.payments.checked, 0);
    assert_eq!(h.dispatcher.sent_count(), 1);
}

#[tokio::test]
async fn test_overlapping_sweeps_converge_with_one_notification() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");

    let (a, b) = tokio::join!(h.scheduler.run_sweep(), h.scheduler.run_sweep());
    let (a, b) = (a.unwrap(), b.unwrap());

    for report in [&a, &b] {
        for result in &report.payments.results {
            assert!(matches!(
                result.outcome,
                RecordOutcome::Updated | RecordOutcome::Unchanged
            ));
            assert_eq!(result.status, CanonicalStatus::Completed);
        }
    }
    let stored = h.load(&record).await;
    assert_eq!(stored.status(), CanonicalStatus::Completed);
    assert_eq!(stored.version(), 1);
    assert_eq!(h.dispatcher.sent_count(), 1);
}

#[tokio::test]
async fn test_unchanged_status_only_stamps_check() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::AirtelMoney, Some("tx-1"), CanonicalStatus::Processing)
        .await;
    h.airtel.set_payment_status("tx-1", "TIP");

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.results[0].outcome, RecordOutcome::Unchanged);
    let stored = h.load(&record).await;
    assert_eq!(stored.status(), CanonicalStatus::Processing);
    assert_eq!(stored.version(), 0);
    assert!(stored.last_checked_at().is_some());
    assert_eq!(h.dispatcher.sent_count(), 0);
}

#[tokio::test]
async fn test_invalid_transition_is_reported_and_ignored() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    // CREATED maps to pending, which processing cannot go back to
    h.mtn.set_payment_status("ref-1", "CREATED");

    let report = h.scheduler.run_sweep().await.unwrap();

    let result = &report.payments.results[0];
    assert_eq!(result.outcome, RecordOutcome::Error);
    assert_eq!(result.status, CanonicalStatus::Processing);
    assert_eq!(h.load(&record).await.version(), 0);
    assert_eq!(h.dispatcher.sent_count(), 0);
}

#[tokio::test]
async fn test_provider_failure_does_not_abort_sweep() {
    let h = TestHarness::new();
    let mtn_payment = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    let airtel_payment = h
        .add_payment(ProviderId::AirtelMoney, Some("tx-1"), CanonicalStatus::Pending)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");
    h.airtel.set_unavailable(true);

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.checked, 2);
    assert_eq!(report.payments.count(RecordOutcome::Updated), 1);
    assert_eq!(report.payments.count(RecordOutcome::ProviderUnavailable), 1);

    assert_eq!(h.load(&mtn_payment).await.status(), CanonicalStatus::Completed);
    let untouched = h.load(&airtel_payment).await;
    assert_eq!(untouched, airtel_payment);
}

#[tokio::test]
async fn test_provider_timeout_leaves_record_pending() {
    let h = TestHarness::with_config(ReconcileConfig {
        provider_timeout: Duration::from_millis(50),
        ..ReconcileConfig::default()
    });
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Pending)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");
    h.mtn.set_delay(Some(Duration::from_millis(500)));

    let report = h.scheduler.run_sweep().await.unwrap();

    let result = &report.payments.results[0];
    assert_eq!(result.outcome, RecordOutcome::ProviderUnavailable);
    assert_eq!(result.status, CanonicalStatus::Pending);
    assert_eq!(h.load(&record).await, record);
    assert_eq!(h.dispatcher.sent_count(), 0);
}

#[tokio::test]
async fn test_unknown_native_status_is_a_mapping_anomaly() {
    let h = TestHarness::new();
    let scripted = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    // never scripted: the provider answers NOT_FOUND
    let missing = h
        .add_payment(ProviderId::MtnMomo, Some("ref-2"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_payment_status("ref-1", "ON_HOLD");

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.count(RecordOutcome::MappingAnomaly), 2);
    for record in [&scripted, &missing] {
        let stored = h.load(record).await;
        assert_eq!(stored.status(), CanonicalStatus::Processing);
        assert_eq!(stored.version(), 0);
    }
}

#[tokio::test]
async fn test_record_without_reference_is_skipped() {
    let h = TestHarness::new();
    h.add_payment(ProviderId::MtnMomo, None, CanonicalStatus::Pending)
        .await;

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.results[0].outcome, RecordOutcome::Skipped);
    assert_eq!(h.mtn.status_check_count(), 0);
}

#[tokio::test]
async fn test_payer_timeout_payout_is_retried() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "FAILED", Some("EXPIRED"));

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payouts.results[0].outcome, RecordOutcome::Retried);
    assert_eq!(report.payouts.results[0].reference.as_deref(), Some("MTN-0001"));

    let stored = h.load(&record).await;
    let payout = stored.as_payout().unwrap();
    assert_eq!(payout.status, CanonicalStatus::Processing);
    assert_eq!(payout.retry_count, 1);
    assert_eq!(payout.provider_reference.as_deref(), Some("MTN-0001"));
    assert_eq!(payout.retry_history.len(), 1);
    assert_eq!(payout.retry_history[0].previous_reference.as_deref(), Some("ref-0"));
    assert_eq!(payout.retry_history[0].new_reference, "MTN-0001");
    assert_eq!(h.mtn.initiate_count(), 1);
    assert_eq!(h.dispatcher.sent_count(), 0);

    // the old reference still resolves to the payout
    let found = h
        .store
        .find_by_reference(RecordKind::Payout, ProviderId::MtnMomo, "ref-0")
        .await
        .unwrap();
    assert_eq!(found.map(|r| r.id()), Some(record.id()));
}

#[tokio::test]
async fn test_retries_stop_at_max_then_fail_once() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    let max = RetryPolicy::default().max_retries;
    let mut now = Utc::now();

    let mut outcomes = Vec::new();
    for _ in 0..=max {
        let current = h.load(&record).await;
        let reference = current.provider_reference().unwrap().to_string();
        h.mtn.set_payout_status(&reference, "FAILED", Some("EXPIRED"));

        let result = h.reconciler.reconcile_record(current, now).await.unwrap();
        outcomes.push(result.outcome);
        now += ChronoDuration::minutes(10);
    }

    let mut expected = vec![RecordOutcome::Retried; max as usize];
    expected.push(RecordOutcome::RetriesExhausted);
    assert_eq!(outcomes, expected);

    let stored = h.load(&record).await;
    let payout = stored.as_payout().unwrap();
    assert_eq!(payout.status, CanonicalStatus::Failed);
    assert_eq!(payout.retry_count, max);
    assert!(payout.max_retries_reached);
    assert_eq!(h.mtn.initiate_count(), max as usize);

    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::PayoutFailed);
    assert_eq!(sent[0].recipient, "driver-1");
    assert_eq!(sent[0].payload["maxRetriesReached"], true);
}

#[tokio::test]
async fn test_exhaustion_in_concurrent_passes_notifies_once() {
    let h = TestHarness::new();
    let max = RetryPolicy::default().max_retries;
    let record = h
        .add_payout("ref-3", |p| {
            p.retry_count = max;
            p.last_retry_at = Some(Utc::now() - ChronoDuration::minutes(30));
        })
        .await;
    h.mtn.set_payout_status("ref-3", "FAILED", Some("EXPIRED"));

    let now = Utc::now();
    let (a, b) = tokio::join!(
        h.reconciler.reconcile_record(record.clone(), now),
        h.reconciler.reconcile_record(record.clone(), now),
    );
    let outcomes = [a.unwrap().outcome, b.unwrap().outcome];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == RecordOutcome::RetriesExhausted)
            .count(),
        1
    );
    assert!(outcomes.contains(&RecordOutcome::Unchanged));
    assert_eq!(h.load(&record).await.status(), CanonicalStatus::Failed);
    assert_eq!(h.dispatcher.sent_count(), 1);
    assert_eq!(h.mtn.initiate_count(), 0);
}

#[tokio::test]
async fn test_concurrent_passes_initiate_one_retry() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "FAILED", Some("EXPIRED"));

    let now = Utc::now();
    let (a, b) = tokio::join!(
        h.reconciler.reconcile_record(record.clone(), now),
        h.reconciler.reconcile_record(record.clone(), now),
    );
    let outcomes = [a.unwrap().outcome, b.unwrap().outcome];

    assert!(outcomes.contains(&RecordOutcome::Retried));
    assert!(outcomes.contains(&RecordOutcome::RetryDeferred));
    assert_eq!(h.mtn.initiate_count(), 1);
    let stored = h.load(&record).await;
    assert_eq!(stored.as_payout().unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_recent_attempt_defers_retry() {
    let h = TestHarness::new();
    let record = h
        .add_payout("ref-1", |p| {
            p.retry_count = 1;
            p.last_retry_at = Some(Utc::now() - ChronoDuration::minutes(1));
        })
        .await;
    h.mtn.set_payout_status("ref-1", "FAILED", Some("EXPIRED"));

    let result = h
        .reconciler
        .reconcile_record(record.clone(), Utc::now())
        .await
        .unwrap();

    assert_eq!(result.outcome, RecordOutcome::RetryDeferred);
    assert!(result.detail.unwrap().starts_with("next attempt due at"));
    assert_eq!(h.mtn.initiate_count(), 0);
    assert_eq!(h.load(&record).await.status(), CanonicalStatus::Processing);
}

#[tokio::test]
async fn test_non_retryable_reason_fails_payout() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "FAILED", Some("PAYEE_NOT_FOUND"));

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payouts.results[0].outcome, RecordOutcome::Updated);
    let stored = h.load(&record).await;
    assert_eq!(stored.status(), CanonicalStatus::Failed);
    assert!(stored.error_message().unwrap().contains("PAYEE_NOT_FOUND"));
    assert!(!stored.as_payout().unwrap().max_retries_reached);
    assert_eq!(h.mtn.initiate_count(), 0);
    assert_eq!(h.dispatcher.sent_count(), 1);
}

#[tokio::test]
async fn test_rejected_retry_fails_payout() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "FAILED", Some("EXPIRED"));
    h.mtn.set_reject_initiate(Some("PAYEE_NOT_ALLOWED_TO_RECEIVE"));

    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payouts.results[0].outcome, RecordOutcome::Updated);
    let stored = h.load(&record).await;
    let payout = stored.as_payout().unwrap();
    assert_eq!(payout.status, CanonicalStatus::Failed);
    assert_eq!(payout.retry_count, 0);
    assert!(
        payout
            .error_message
            .as_deref()
            .unwrap()
            .contains("PAYEE_NOT_ALLOWED_TO_RECEIVE")
    );
    assert_eq!(h.dispatcher.sent_count(), 1);
}

#[tokio::test]
async fn test_unavailable_retry_waits_for_next_window() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "FAILED", Some("EXPIRED"));
    h.mtn.set_initiate_unavailable(true);
    let now = Utc::now();

    let first = h
        .reconciler
        .reconcile_record(record.clone(), now)
        .await
        .unwrap();
    assert_eq!(first.outcome, RecordOutcome::ProviderUnavailable);

    let stored = h.load(&record).await;
    let payout = stored.as_payout().unwrap();
    assert_eq!(payout.retry_count, 0);
    assert!(payout.retry_history.is_empty());
    assert_eq!(payout.status, CanonicalStatus::Processing);
    assert_eq!(payout.last_retry_at, Some(now));

    h.mtn.set_initiate_unavailable(false);
    let second = h
        .reconciler
        .reconcile_record(stored.clone(), now + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert_eq!(second.outcome, RecordOutcome::RetryDeferred);

    let third = h
        .reconciler
        .reconcile_record(h.load(&record).await, now + ChronoDuration::minutes(6))
        .await
        .unwrap();
    assert_eq!(third.outcome, RecordOutcome::Retried);
    assert_eq!(h.mtn.initiate_count(), 1);
}

#[tokio::test]
async fn test_completed_payout_is_notified() {
    let h = TestHarness::new();
    let record = h.add_payout("ref-0", |_| {}).await;
    h.mtn.set_payout_status("ref-0", "SUCCESSFUL", None);

    h.scheduler.run_sweep().await.unwrap();

    assert_eq!(h.load(&record).await.status(), CanonicalStatus::Completed);
    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::PayoutCompleted);
}

/// Provider that takes the transfer but answers after the caller gave up.
struct LateAnswerAdapter {
    inner: InMemoryProviderAdapter,
    answer_after: Duration,
}

#[async_trait]
impl ProviderAdapter for LateAnswerAdapter {
    fn provider(&self) -> ProviderId {
        self.inner.provider()
    }

    fn new_reference(&self) -> String {
        self.inner.new_reference()
    }

    async fn initiate(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome> {
        let outcome = self.inner.initiate(request).await;
        tokio::time::sleep(self.answer_after).await;
        outcome
    }

    async fn check_payment_status(&self, reference: &str) -> ProviderResult<PaymentCheck> {
        self.inner.check_payment_status(reference).await
    }

    async fn check_payout_status(&self, reference: &str) -> ProviderResult<PayoutCheck> {
        self.inner.check_payout_status(reference).await
    }
}

#[tokio::test]
async fn test_retry_answered_late_is_not_initiated_again() {
    let store = InMemoryRecordStore::new();
    let mtn = InMemoryProviderAdapter::new(ProviderId::MtnMomo);
    let gate = NotificationGate::new(
        Arc::new(InMemoryNotificationLog::new()),
        Arc::new(InMemoryNotificationDispatcher::new()),
    );
    let registry = ProviderRegistry::new().with(Arc::new(LateAnswerAdapter {
        inner: mtn.clone(),
        answer_after: Duration::from_millis(200),
    }));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(store.clone()),
        gate,
        registry,
        ReconcileConfig {
            stale_after: ChronoDuration::zero(),
            provider_timeout: Duration::from_millis(50),
            retry_policy: RetryPolicy::new(3, ChronoDuration::zero()),
            ..ReconcileConfig::default()
        },
    ));
    let scheduler = ReconciliationScheduler::new(reconciler);

    let payout: TransactionRecord = Payout::new(
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
    .created_at(Utc::now() - ChronoDuration::minutes(10))
    .into();
    store.insert(payout.clone()).await.unwrap();
    mtn.set_payout_status("ref-0", "FAILED", Some("EXPIRED"));

    let first = scheduler.run_sweep().await.unwrap();
    assert_eq!(
        first.payouts.results[0].outcome,
        RecordOutcome::ProviderUnavailable
    );
    let stored = store.require(RecordKind::Payout, payout.id()).await.unwrap();
    assert_eq!(
        stored.as_payout().unwrap().pending_retry_reference.as_deref(),
        Some("MTN-0001")
    );

    let second = scheduler.run_sweep().await.unwrap();
    assert_eq!(second.payouts.results[0].outcome, RecordOutcome::Retried);
    scheduler.run_sweep().await.unwrap();

    assert_eq!(mtn.initiate_count(), 1);
    let stored = store.require(RecordKind::Payout, payout.id()).await.unwrap();
    let p = stored.as_payout().unwrap();
    assert_eq!(p.retry_count, 1);
    assert_eq!(p.retry_history.len(), 1);
    assert_eq!(p.provider_reference.as_deref(), Some("MTN-0001"));
    assert!(p.pending_retry_reference.is_none());
    assert_eq!(p.status, CanonicalStatus::Processing);
}

#[tokio::test]
async fn test_failed_notification_goes_out_on_a_later_sweep() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");
    h.dispatcher.set_fail_on_send(true);

    let first = h.scheduler.run_sweep().await.unwrap();
    assert_eq!(first.payments.results[0].outcome, RecordOutcome::Updated);
    assert_eq!(first.notifications_redelivered, 0);
    assert_eq!(h.load(&record).await.status(), CanonicalStatus::Completed);
    assert_eq!(h.dispatcher.sent_count(), 0);

    h.dispatcher.set_fail_on_send(false);
    let second = h.scheduler.run_sweep().await.unwrap();
    assert_eq!(second.payments.checked, 0);
    assert_eq!(second.notifications_redelivered, 1);

    for _ in 0..2 {
        h.scheduler.run_sweep().await.unwrap();
    }
    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::PaymentCompleted);
    assert_eq!(sent[0].payload["status"], "completed");
}

#[tokio::test]
async fn test_sweep_checks_payments_and_payouts_together() {
    let h = TestHarness::new();
    let delay = Duration::from_millis(300);
    for n in 0..3 {
        let reference = format!("pay-{n}");
        h.add_payment(ProviderId::MtnMomo, Some(&reference), CanonicalStatus::Processing)
            .await;
        h.mtn.set_payment_status(&reference, "SUCCESSFUL");

        let reference = format!("out-{n}");
        h.add_payout(&reference, |_| {}).await;
        h.mtn.set_payout_status(&reference, "SUCCESSFUL", None);
    }
    h.mtn.set_delay(Some(delay));

    let started = Instant::now();
    let report = h.scheduler.run_sweep().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.payments.count(RecordOutcome::Updated), 3);
    assert_eq!(report.payouts.count(RecordOutcome::Updated), 3);
    assert!(elapsed < delay * 2 - Duration::from_millis(50), "sweep took {elapsed:?}");
}

#[tokio::test]
async fn test_sweep_concurrency_bounds_the_whole_sweep() {
    let h = TestHarness::with_config(ReconcileConfig {
        concurrency: 2,
        ..ReconcileConfig::default()
    });
    let delay = Duration::from_millis(150);
    for n in 0..2 {
        let reference = format!("pay-{n}");
        h.add_payment(ProviderId::MtnMomo, Some(&reference), CanonicalStatus::Processing)
            .await;
        h.mtn.set_payment_status(&reference, "SUCCESSFUL");

        let reference = format!("out-{n}");
        h.add_payout(&reference, |_| {}).await;
        h.mtn.set_payout_status(&reference, "SUCCESSFUL", None);
    }
    h.mtn.set_delay(Some(delay));

    let started = Instant::now();
    let report = h.scheduler.run_sweep().await.unwrap();

    assert_eq!(report.payments.checked + report.payouts.checked, 4);
    assert!(started.elapsed() >= delay * 2);
}

fn status_request(reference: &str, booking: Option<&str>, caller: &str) -> StatusRequest {
    StatusRequest {
        provider: ProviderId::MtnMomo,
        reference: reference.to_string(),
        booking_reference: booking.map(String::from),
        caller: caller.to_string(),
    }
}

#[tokio::test]
async fn test_on_demand_check_reconciles_payment() {
    let h = TestHarness::new();
    let record = h
        .add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_payment_status("ref-1", "SUCCESSFUL");
    let on_demand = OnDemandStatus::new(h.reconciler.clone());

    let view = on_demand
        .check(&status_request("ref-1", Some("booking-1"), "user-1"))
        .await
        .unwrap();

    assert_eq!(view.transaction_id, record.id());
    assert_eq!(view.status, CanonicalStatus::Completed);
    assert!(!view.stale);
    assert_eq!(view.outcome, Some(RecordOutcome::Updated));
    assert_eq!(h.dispatcher.sent_count(), 1);
}

#[tokio::test]
async fn test_on_demand_serves_last_status_when_provider_down() {
    let h = TestHarness::new();
    h.add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    h.mtn.set_unavailable(true);
    let on_demand = OnDemandStatus::new(h.reconciler.clone());

    let view = on_demand
        .check(&status_request("ref-1", None, "user-1"))
        .await
        .unwrap();

    assert_eq!(view.status, CanonicalStatus::Processing);
    assert!(view.stale);
    assert_eq!(view.message, "Payment is being processed");
}

#[tokio::test]
async fn test_on_demand_terminal_payment_skips_provider() {
    let h = TestHarness::new();
    h.add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Completed)
        .await;
    let on_demand = OnDemandStatus::new(h.reconciler.clone());

    let view = on_demand
        .check(&status_request("ref-1", None, "user-1"))
        .await
        .unwrap();

    assert_eq!(view.status, CanonicalStatus::Completed);
    assert!(!view.stale);
    assert_eq!(h.mtn.status_check_count(), 0);
}

#[tokio::test]
async fn test_on_demand_hides_foreign_and_unknown_payments() {
    let h = TestHarness::new();
    h.add_payment(ProviderId::MtnMomo, Some("ref-1"), CanonicalStatus::Processing)
        .await;
    let on_demand = OnDemandStatus::new(h.reconciler.clone());

    for request in [
        status_request("ref-404", None, "user-1"),
        status_request("ref-1", None, "user-2"),
        status_request("ref-1", Some("booking-2"), "user-1"),
    ] {
        let err = on_demand.check(&request).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RecordNotFound(_)));
    }
    assert_eq!(h.mtn.status_check_count(), 0);
}

//! Per-record reconciliation pipeline.
//!
//! One pass over a record: provider check, status mapping, then either a
//! status change through the orchestrator or, for failed payouts, the retry
//! policy and its execution path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use domain::{
    CanonicalStatus, NoRetryReason, Payout, RetryDecision, RetryInput, TransactionRecord,
};
use providers::{MappedStatus, ProviderAdapter, ProviderRegistry, ProviderUnavailable, map_status};
use record_store::{RecordStore, RecordStoreExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::notification::NotificationGate;
use crate::orchestrator::{ApplyOutcome, OrchestrationService, StatusContext};
use crate::retry::PayoutRetrier;

/// What a reconciliation pass did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Provider agrees with the stored status.
    Unchanged,
    /// A new status was persisted.
    Updated,
    /// A failed payout was re-initiated.
    Retried,
    /// A failed payout is eligible for retry but not yet due.
    RetryDeferred,
    /// A failed payout used every retry and was failed terminally.
    RetriesExhausted,
    ProviderUnavailable,
    MappingAnomaly,
    /// Nothing to check: no reference yet, or no adapter for the provider.
    Skipped,
    Error,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Unchanged => "unchanged",
            RecordOutcome::Updated => "updated",
            RecordOutcome::Retried => "retried",
            RecordOutcome::RetryDeferred => "retry_deferred",
            RecordOutcome::RetriesExhausted => "retries_exhausted",
            RecordOutcome::ProviderUnavailable => "provider_unavailable",
            RecordOutcome::MappingAnomaly => "mapping_anomaly",
            RecordOutcome::Skipped => "skipped",
            RecordOutcome::Error => "error",
        }
    }

    /// True when the provider gave an answer this pass acted on.
    pub fn is_fresh(&self) -> bool {
        matches!(
            self,
            RecordOutcome::Unchanged
                | RecordOutcome::Updated
                | RecordOutcome::Retried
                | RecordOutcome::RetryDeferred
                | RecordOutcome::RetriesExhausted
        )
    }
}

/// Per-record line of a sweep report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub record_id: RecordId,
    pub reference: Option<String>,
    pub provider: ProviderId,
    pub outcome: RecordOutcome,
    /// Status as persisted after the pass.
    pub status: CanonicalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RecordResult {
    pub fn new(record: &TransactionRecord, outcome: RecordOutcome) -> Self {
        Self {
            record_id: record.id(),
            reference: record.provider_reference().map(String::from),
            provider: record.provider(),
            outcome,
            status: record.status(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Provider answer for either record kind.
#[derive(Debug)]
struct StatusCheck {
    native_status: String,
    reason_code: Option<String>,
    raw: Value,
}

/// Runs single-record reconciliation passes.
pub struct Reconciler {
    orchestrator: OrchestrationService,
    retrier: PayoutRetrier,
    registry: ProviderRegistry,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gate: NotificationGate,
        registry: ProviderRegistry,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            orchestrator: OrchestrationService::new(store.clone(), gate),
            retrier: PayoutRetrier::new(store, config.retry_policy, config.provider_timeout),
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.orchestrator.store()
    }

    pub fn orchestrator(&self) -> &OrchestrationService {
        &self.orchestrator
    }

    pub fn gate(&self) -> &NotificationGate {
        self.orchestrator.gate()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconciles one record against its provider.
    ///
    /// Per-record failures become an outcome on the result. Only store
    /// infrastructure failures are returned as errors.
    #[tracing::instrument(
        skip_all,
        fields(record_id = %record.id(), kind = %record.kind(), provider = %record.provider())
    )]
    pub async fn reconcile_record(
        &self,
        record: TransactionRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordResult> {
        let result = match self.process(&record, now).await {
            Ok(result) => result,
            Err(e) if e.is_infrastructure() => {
                tracing::error!(error = %e, "record store unavailable");
                return Err(e);
            }
            Err(e) => failure_result(&record, e),
        };

        metrics::counter!(
            "reconciliation_records_checked_total",
            "kind" => record.kind().as_str(),
            "outcome" => result.outcome.as_str()
        )
        .increment(1);
        Ok(result)
    }

    async fn process(&self, record: &TransactionRecord, now: DateTime<Utc>) -> Result<RecordResult> {
        let Some(reference) = record.provider_reference() else {
            return Ok(RecordResult::new(record, RecordOutcome::Skipped)
                .with_detail("awaiting provider reference"));
        };
        let Some(adapter) = self.registry.get(record.provider()) else {
            return Ok(RecordResult::new(record, RecordOutcome::Skipped)
                .with_detail(format!("no adapter registered for {}", record.provider())));
        };

        let check = self.check(adapter.as_ref(), record.kind(), reference).await?;
        self.store()
            .mark_checked(record.kind(), record.id(), now)
            .await?;

        let target = match map_status(record.provider(), &check.native_status) {
            MappedStatus::Canonical(status) => status,
            MappedStatus::Unknown => {
                return Err(ReconcileError::MappingAnomaly {
                    provider: record.provider(),
                    native: check.native_status,
                });
            }
        };

        if let Some(payout) = record.as_payout() {
            if target == CanonicalStatus::Failed && payout.status.is_in_flight() {
                return self
                    .handle_failed_payout(payout.clone(), adapter.as_ref(), check, now)
                    .await;
            }
        }

        let context = StatusContext::new().with_provider_response(check.raw);
        self.apply(record, target, context, RecordOutcome::Updated)
            .await
    }

    async fn check(
        &self,
        adapter: &dyn ProviderAdapter,
        kind: RecordKind,
        reference: &str,
    ) -> Result<StatusCheck> {
        let call = async {
            match kind {
                RecordKind::Payment => {
                    adapter
                        .check_payment_status(reference)
                        .await
                        .map(|c| StatusCheck {
                            native_status: c.native_status,
                            reason_code: None,
                            raw: c.raw,
                        })
                }
                RecordKind::Payout => {
                    adapter
                        .check_payout_status(reference)
                        .await
                        .map(|c| StatusCheck {
                            native_status: c.native_status,
                            reason_code: c.reason_code,
                            raw: c.raw,
                        })
                }
            }
        };

        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(Ok(check)) => Ok(check),
            Ok(Err(source)) => Err(ReconcileError::ProviderUnavailable {
                provider: adapter.provider(),
                source,
            }),
            Err(_) => Err(ReconcileError::ProviderUnavailable {
                provider: adapter.provider(),
                source: ProviderUnavailable::Timeout,
            }),
        }
    }

    async fn apply(
        &self,
        record: &TransactionRecord,
        target: CanonicalStatus,
        context: StatusContext,
        applied: RecordOutcome,
    ) -> Result<RecordResult> {
        let outcome = self
            .orchestrator
            .apply_status_change(record, target, context)
            .await?;

        Ok(match outcome {
            ApplyOutcome::Unchanged { record } => {
                RecordResult::new(&record, RecordOutcome::Unchanged)
            }
            ApplyOutcome::Applied { from, record, .. } => RecordResult::new(&record, applied)
                .with_detail(format!("{from} -> {}", record.status())),
        })
    }

    /// Provider reported the payout failed: consult the retry policy.
    async fn handle_failed_payout(
        &self,
        mut payout: Payout,
        adapter: &dyn ProviderAdapter,
        check: StatusCheck,
        now: DateTime<Utc>,
    ) -> Result<RecordResult> {
        let reason = check.reason_code.as_deref();
        let policy = self.retrier.policy();

        for attempt in 0..2 {
            let decision = policy.decide(RetryInput::for_payout(&payout, reason, now));
            tracing::debug!(?decision, reason_code = reason, "retry decision");

            match decision {
                RetryDecision::NoRetry(NoRetryReason::Terminal) => {
                    return Ok(RecordResult::new(
                        &TransactionRecord::Payout(payout),
                        RecordOutcome::Unchanged,
                    ));
                }
                RetryDecision::NoRetry(NoRetryReason::NonRetryableReason) => {
                    let context = StatusContext::new()
                        .with_provider_response(check.raw.clone())
                        .with_error(failure_message(reason));
                    return self
                        .apply(
                            &TransactionRecord::Payout(payout),
                            CanonicalStatus::Failed,
                            context,
                            RecordOutcome::Updated,
                        )
                        .await;
                }
                RetryDecision::Exhausted => {
                    metrics::counter!(
                        "payout_retries_exhausted_total",
                        "provider" => payout.provider.as_str()
                    )
                    .increment(1);
                    tracing::warn!(retry_count = payout.retry_count, "payout retries exhausted");
                    let context = StatusContext::new()
                        .with_provider_response(check.raw.clone())
                        .with_error(format!(
                            "max retries ({}) reached: {}",
                            policy.max_retries,
                            failure_message(reason)
                        ))
                        .max_retries_reached();
                    return self
                        .apply(
                            &TransactionRecord::Payout(payout),
                            CanonicalStatus::Failed,
                            context,
                            RecordOutcome::RetriesExhausted,
                        )
                        .await;
                }
                RetryDecision::Deferred { due_at } => {
                    return Ok(RecordResult::new(
                        &TransactionRecord::Payout(payout),
                        RecordOutcome::RetryDeferred,
                    )
                    .with_detail(format!("next attempt due at {}", due_at.to_rfc3339())));
                }
                RetryDecision::RetryNow => {
                    // allow-listed codes always come with a reason
                    let reason_code = reason.unwrap_or_default();
                    match self.retrier.retry(&payout, adapter, reason_code, now).await {
                        Ok(updated) => {
                            let attempt = updated
                                .as_payout()
                                .map(|p| p.retry_count)
                                .unwrap_or_default();
                            return Ok(RecordResult::new(&updated, RecordOutcome::Retried)
                                .with_detail(format!("retry attempt {attempt}")));
                        }
                        Err(ReconcileError::RetryRejected {
                            reason_code, raw, ..
                        }) => {
                            let fresh = self.store().require(RecordKind::Payout, payout.id).await?;
                            let context = StatusContext::new()
                                .with_provider_response(raw)
                                .with_error(format!("retry rejected by provider: {reason_code}"));
                            return self
                                .apply(&fresh, CanonicalStatus::Failed, context, RecordOutcome::Updated)
                                .await;
                        }
                        Err(ReconcileError::StoreConflict { .. }) if attempt == 0 => {
                            tracing::debug!("payout changed concurrently, re-evaluating");
                            match self.store().require(RecordKind::Payout, payout.id).await? {
                                TransactionRecord::Payout(fresh) => payout = fresh,
                                other => {
                                    return Ok(RecordResult::new(&other, RecordOutcome::Skipped));
                                }
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(ReconcileError::StoreConflict {
            kind: RecordKind::Payout,
            record_id: payout.id,
        })
    }
}

fn failure_message(reason: Option<&str>) -> String {
    match reason {
        Some(code) => format!("provider reported failure: {code}"),
        None => "provider reported failure".to_string(),
    }
}

/// Converts a per-record error into its reported outcome, logging it.
fn failure_result(record: &TransactionRecord, err: ReconcileError) -> RecordResult {
    let outcome = match &err {
        ReconcileError::ProviderUnavailable { provider, source } => {
            metrics::counter!(
                "provider_unavailable_total",
                "provider" => provider.as_str(),
                "reason" => source.reason()
            )
            .increment(1);
            tracing::warn!(error = %source, "provider unavailable, record left untouched");
            RecordOutcome::ProviderUnavailable
        }
        ReconcileError::MappingAnomaly { provider, native } => {
            metrics::counter!("status_mapping_anomalies_total", "provider" => provider.as_str())
                .increment(1);
            tracing::warn!(native_status = %native, "unrecognised provider status, no change");
            RecordOutcome::MappingAnomaly
        }
        ReconcileError::InvalidTransition { .. } => RecordOutcome::Error,
        other => {
            tracing::warn!(error = %other, "record reconciliation failed");
            RecordOutcome::Error
        }
    };
    RecordResult::new(record, outcome).with_detail(err.to_string())
}

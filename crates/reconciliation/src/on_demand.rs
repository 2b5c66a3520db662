//! Synchronous single-payment status check.

use std::sync::Arc;

use chrono::Utc;
use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, TransactionRecord};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::reconciler::{RecordOutcome, Reconciler};

/// A caller asking about one of their payments.
#[derive(Debug, Clone)]
pub struct StatusRequest {
    pub provider: ProviderId,
    pub reference: String,
    /// When present, must match the payment's booking.
    pub booking_reference: Option<String>,
    /// Authenticated user making the request.
    pub caller: String,
}

/// Status answer returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub transaction_id: RecordId,
    pub reference: String,
    pub status: CanonicalStatus,
    pub message: String,
    /// True when the provider could not confirm the status during this call.
    pub stale: bool,
    /// What the reconciliation pass did, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RecordOutcome>,
}

/// Runs the per-record pipeline for one payment, on request.
///
/// Provider failures never reach the caller: the last persisted status is
/// returned with `stale` set instead.
#[derive(Clone)]
pub struct OnDemandStatus {
    reconciler: Arc<Reconciler>,
}

impl OnDemandStatus {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    #[tracing::instrument(skip_all, fields(provider = %request.provider, reference = %request.reference))]
    pub async fn check(&self, request: &StatusRequest) -> Result<StatusView> {
        let record = self
            .reconciler
            .store()
            .find_by_reference(RecordKind::Payment, request.provider, &request.reference)
            .await?
            .filter(|record| visible_to(record, request))
            .ok_or_else(|| ReconcileError::RecordNotFound(request.reference.clone()))?;

        if !record.status().is_in_flight() {
            return Ok(view(&request.reference, &record, record.status(), None));
        }

        let result = self
            .reconciler
            .reconcile_record(record.clone(), Utc::now())
            .await?;
        if !result.outcome.is_fresh() {
            tracing::info!(outcome = result.outcome.as_str(), "serving last known status");
        }
        Ok(view(
            &request.reference,
            &record,
            result.status,
            Some(result.outcome),
        ))
    }
}

/// Unknown references, foreign payments and booking mismatches all look the
/// same to the caller. A payment without a recorded payer belongs to nobody.
fn visible_to(record: &TransactionRecord, request: &StatusRequest) -> bool {
    if let Some(booking) = &request.booking_reference {
        if record.booking_id() != booking {
            return false;
        }
    }
    record.recipient() == Some(request.caller.as_str())
}

fn view(
    reference: &str,
    record: &TransactionRecord,
    status: CanonicalStatus,
    outcome: Option<RecordOutcome>,
) -> StatusView {
    StatusView {
        transaction_id: record.id(),
        reference: reference.to_string(),
        status,
        message: status_message(status).to_string(),
        stale: outcome.is_some_and(|o| !o.is_fresh()),
        outcome,
    }
}

/// User-facing wording for a payment status.
pub fn status_message(status: CanonicalStatus) -> &'static str {
    match status {
        CanonicalStatus::Pending => "Payment is awaiting confirmation",
        CanonicalStatus::Processing => "Payment is being processed",
        CanonicalStatus::Completed => "Payment completed successfully",
        CanonicalStatus::Failed => "Payment failed",
        CanonicalStatus::Cancelled => "Payment was cancelled",
        CanonicalStatus::Refunded => "Payment was refunded",
    }
}

//! Execution side of the payout retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::RecordKind;
use domain::{Payout, RetryPolicy, TransactionRecord};
use providers::{
    InitiateOutcome, InitiateRequest, NATIVE_NOT_FOUND, ProviderAdapter, ProviderResult,
    ProviderUnavailable,
};
use record_store::{RecordStore, RecordStoreExt};

use crate::error::{ReconcileError, Result};

/// Metadata key holding the provider's answer to the latest retry.
pub const LAST_RETRY_RESPONSE: &str = "last_retry_response";

/// Re-initiates failed payouts through their provider.
///
/// An attempt is claimed with a conditional write before the provider is
/// called, so two passes that decided "retry now" from the same snapshot
/// cannot both initiate a transfer. The claim also stores the attempt's
/// reference: when the provider's answer is lost, the next attempt looks the
/// reference up and resends under it instead of starting a new transfer.
#[derive(Clone)]
pub struct PayoutRetrier {
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    provider_timeout: Duration,
}

impl PayoutRetrier {
    pub fn new(store: Arc<dyn RecordStore>, policy: RetryPolicy, provider_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            provider_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Initiates a new transfer for `payout` and records it as a retry.
    ///
    /// Fails with `StoreConflict` if another writer got to the payout first,
    /// `ProviderUnavailable` if the provider could not be asked (the payout
    /// keeps its count, history and status), and `RetryRejected` if the
    /// provider refused the transfer.
    #[tracing::instrument(skip_all, fields(record_id = %payout.id, provider = %payout.provider, attempt = payout.retry_count + 1))]
    pub async fn retry(
        &self,
        payout: &Payout,
        adapter: &dyn ProviderAdapter,
        reason_code: &str,
        now: DateTime<Utc>,
    ) -> Result<TransactionRecord> {
        let max = self.policy.max_retries;

        let resumed = payout.pending_retry_reference.clone();
        let reference = resumed.clone().unwrap_or_else(|| adapter.new_reference());

        let mut claim = payout.clone();
        claim.begin_retry_attempt(reference.clone(), now, max)?;
        claim.updated_at = now;
        let mut claimed = TransactionRecord::Payout(claim);
        self.store.save(&mut claimed).await?;

        let request = InitiateRequest {
            kind: RecordKind::Payout,
            record_id: payout.id,
            reference,
            amount: payout.amount,
            currency: payout.currency.clone(),
            phone: payout.destination_phone.clone(),
            note: Some(format!("Payout for booking {}", payout.booking_id)),
        };
        let attempt = Self::send(adapter, &request, resumed.is_some());
        let outcome = match tokio::time::timeout(self.provider_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderUnavailable::Timeout),
        }
        .map_err(|source| ReconcileError::ProviderUnavailable {
            provider: payout.provider,
            source,
        })?;

        let (reference, raw) = match outcome {
            InitiateOutcome::Accepted { reference, raw } => (reference, raw),
            InitiateOutcome::Rejected { reason_code, raw } => {
                tracing::warn!(reason_code = %reason_code, "provider refused payout retry");
                return Err(ReconcileError::RetryRejected {
                    record_id: payout.id,
                    reason_code,
                    raw,
                });
            }
        };

        let mut current = claimed;
        for attempt in 0..2 {
            let mut next = current.clone();
            let recorded = next
                .as_payout_mut()
                .ok_or_else(|| ReconcileError::RecordNotFound(payout.id.to_string()))
                .and_then(|p| {
                    p.record_retry(reference.clone(), reason_code, now, max)?;
                    p.metadata
                        .insert(LAST_RETRY_RESPONSE.to_string(), raw.clone());
                    p.updated_at = now;
                    Ok(())
                });
            if let Err(e) = recorded {
                tracing::error!(new_reference = %reference, error = %e, "provider accepted retry but it could not be recorded");
                return Err(e);
            }

            match self.store.save(&mut next).await.map_err(ReconcileError::from) {
                Ok(()) => {
                    metrics::counter!("payout_retries_total", "provider" => payout.provider.as_str())
                        .increment(1);
                    tracing::info!(new_reference = %reference, "payout retried");
                    return Ok(next);
                }
                Err(ReconcileError::StoreConflict { .. }) if attempt == 0 => {
                    current = self.store.require(RecordKind::Payout, payout.id).await?;
                }
                Err(e) => {
                    tracing::error!(new_reference = %reference, error = %e, "provider accepted retry but it could not be recorded");
                    return Err(e);
                }
            }
        }

        Err(ReconcileError::StoreConflict {
            kind: RecordKind::Payout,
            record_id: payout.id,
        })
    }

    /// Initiates `request`, first asking the provider about the reference
    /// when it was already sent by an earlier attempt.
    async fn send(
        adapter: &dyn ProviderAdapter,
        request: &InitiateRequest,
        resumed: bool,
    ) -> ProviderResult<InitiateOutcome> {
        if resumed {
            let check = adapter.check_payout_status(&request.reference).await?;
            if !check.native_status.eq_ignore_ascii_case(NATIVE_NOT_FOUND) {
                tracing::info!(reference = %request.reference, native_status = %check.native_status, "earlier retry found at provider");
                return Ok(InitiateOutcome::Accepted {
                    reference: request.reference.clone(),
                    raw: check.raw,
                });
            }
        }
        adapter.initiate(request).await
    }
}

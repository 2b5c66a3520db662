//! Outbound driver disbursement and its retry history.

use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use serde::{Deserialize, Serialize};

use crate::Metadata;
use crate::error::DomainError;
use crate::status::CanonicalStatus;

/// One re-initiation of a payout after a transient provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number; equals the retry count after the attempt.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub previous_reference: Option<String>,
    pub new_reference: String,
    /// Provider reason code that triggered the retry.
    pub reason: String,
}

/// A driver's share of a booking, sent through a mobile-money provider.
///
/// Invariants:
/// - `retry_history.len() == retry_count as usize`
/// - a new `provider_reference` is only minted by [`Payout::record_retry`]
/// - `pending_retry_reference` holds the reference of a claimed attempt
///   until the provider's acceptance is recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: RecordId,
    pub provider: ProviderId,
    pub provider_reference: Option<String>,
    pub status: CanonicalStatus,
    pub amount: i64,
    pub currency: String,
    pub destination_phone: String,
    pub payment_id: RecordId,
    pub booking_id: String,
    pub driver_id: String,
    pub retry_count: u32,
    pub retry_history: Vec<RetryAttempt>,
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Reference sent with a retry the provider has not answered yet.
    #[serde(default)]
    pub pending_retry_reference: Option<String>,
    pub max_retries_reached: bool,
    pub metadata: Metadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Payout {
    /// Creates a pending payout for a driver's share of a paid booking.
    pub fn new(
        provider: ProviderId,
        payment_id: RecordId,
        amount: i64,
        currency: impl Into<String>,
        destination_phone: impl Into<String>,
        booking_id: impl Into<String>,
        driver_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            provider,
            provider_reference: None,
            status: CanonicalStatus::Pending,
            amount,
            currency: currency.into(),
            destination_phone: destination_phone.into(),
            payment_id,
            booking_id: booking_id.into(),
            driver_id: driver_id.into(),
            retry_count: 0,
            retry_history: Vec::new(),
            last_retry_at: None,
            pending_retry_reference: None,
            max_retries_reached: false,
            metadata: Metadata::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
            version: 0,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.provider_reference = Some(reference.into());
        self
    }

    pub fn with_status(mut self, status: CanonicalStatus) -> Self {
        self.status = status;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Instant of the most recent provider attempt, initial or retry.
    pub fn last_attempt_at(&self) -> DateTime<Utc> {
        self.last_retry_at.unwrap_or(self.created_at)
    }

    /// Moves the payout to `next` if the status graph allows it.
    pub fn transition_to(&mut self, next: CanonicalStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(RecordKind::Payout, next) {
            return Err(DomainError::InvalidTransition {
                kind: RecordKind::Payout,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records the initial provider reference, refusing to overwrite a different one.
    pub fn assign_reference(&mut self, reference: &str) -> Result<(), DomainError> {
        match &self.provider_reference {
            Some(existing) if existing != reference => Err(DomainError::ReferenceAlreadyAssigned {
                existing: existing.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.provider_reference = Some(reference.to_string());
                Ok(())
            }
        }
    }

    /// Stamps the start of a retry attempt before the provider is called.
    ///
    /// Moving `last_retry_at` makes a concurrent pass see the attempt and
    /// defer. `reference` is kept until the provider's answer is recorded so
    /// an attempt that timed out is resumed under the same reference. Count
    /// and history only change once the provider accepts.
    pub fn begin_retry_attempt(
        &mut self,
        reference: impl Into<String>,
        at: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<(), DomainError> {
        if !self.status.is_in_flight() {
            return Err(DomainError::NotInFlight(self.status));
        }
        if self.retry_count >= max_retries {
            return Err(DomainError::RetryLimitReached { max: max_retries });
        }
        self.last_retry_at = Some(at);
        self.pending_retry_reference = Some(reference.into());
        Ok(())
    }


    /// Applies a successful re-initiation: swaps in the new reference,
    /// appends to the history, and leaves the payout `Processing`.
    pub fn record_retry(
        &mut self,
        new_reference: impl Into<String>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<&RetryAttempt, DomainError> {
        if !self.status.is_in_flight() {
            return Err(DomainError::NotInFlight(self.status));
        }
        if self.retry_count >= max_retries {
            return Err(DomainError::RetryLimitReached { max: max_retries });
        }

        let new_reference = new_reference.into();
        self.retry_count += 1;
        self.retry_history.push(RetryAttempt {
            attempt: self.retry_count,
            at,
            previous_reference: self.provider_reference.replace(new_reference.clone()),
            new_reference,
            reason: reason.into(),
        });
        self.last_retry_at = Some(at);
        self.pending_retry_reference = None;
        self.status = CanonicalStatus::Processing;
        self.error_message = None;

        Ok(&self.retry_history[self.retry_history.len() - 1])
    }

    /// Returns true if `reference` was ever used for this payout.
    pub fn has_used_reference(&self, reference: &str) -> bool {
        self.provider_reference.as_deref() == Some(reference)
            || self.retry_history.iter().any(|attempt| {
                attempt.new_reference == reference
                    || attempt.previous_reference.as_deref() == Some(reference)
            })
    }
}

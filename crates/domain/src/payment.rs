//! Inbound customer charge.

use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use serde::{Deserialize, Serialize};

use crate::Metadata;
use crate::error::DomainError;
use crate::status::CanonicalStatus;

/// A customer charge collected through a mobile-money provider.
///
/// `provider_reference` is assigned once, when the provider acknowledges the
/// request, and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: RecordId,
    pub provider: ProviderId,
    pub provider_reference: Option<String>,
    pub status: CanonicalStatus,
    /// Amount in the unit the provider charges in.
    pub amount: i64,
    pub currency: String,
    pub booking_id: String,
    /// User notified about the outcome of this charge.
    pub payer_user_id: Option<String>,
    pub metadata: Metadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every conditional write.
    pub version: i64,
}

impl Payment {
    /// Creates a pending payment for a booking checkout.
    pub fn new(
        provider: ProviderId,
        amount: i64,
        currency: impl Into<String>,
        booking_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            provider,
            provider_reference: None,
            status: CanonicalStatus::Pending,
            amount,
            currency: currency.into(),
            booking_id: booking_id.into(),
            payer_user_id: None,
            metadata: Metadata::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
            version: 0,
        }
    }

    pub fn with_payer(mut self, user_id: impl Into<String>) -> Self {
        self.payer_user_id = Some(user_id.into());
        self
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

    /// Moves the payment to `next` if the status graph allows it.
    pub fn transition_to(&mut self, next: CanonicalStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(RecordKind::Payment, next) {
            return Err(DomainError::InvalidTransition {
                kind: RecordKind::Payment,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records the provider reference, refusing to overwrite a different one.
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Payment {
        Payment::new(ProviderId::MtnMomo, 5000, "UGX", "booking-1")
    }

    #[test]
    fn new_payment_is_pending_without_reference() {
        let p = payment();
        assert_eq!(p.status, CanonicalStatus::Pending);
        assert!(p.provider_reference.is_none());
        assert_eq!(p.version, 0);
    }

    #[test]
    fn transition_follows_graph() {
        let mut p = payment();
        p.transition_to(CanonicalStatus::Processing).unwrap();
        p.transition_to(CanonicalStatus::Completed).unwrap();
        p.transition_to(CanonicalStatus::Refunded).unwrap();
        assert_eq!(p.status, CanonicalStatus::Refunded);
    }

    #[test]
    fn terminal_payment_rejects_transition() {
        let mut p = payment().with_status(CanonicalStatus::Failed);
        let err = p.transition_to(CanonicalStatus::Processing).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(p.status, CanonicalStatus::Failed);
    }

    #[test]
    fn reference_is_write_once() {
        let mut p = payment();
        p.assign_reference("ref-1").unwrap();
        p.assign_reference("ref-1").unwrap();
        assert_eq!(
            p.assign_reference("ref-2"),
            Err(DomainError::ReferenceAlreadyAssigned {
                existing: "ref-1".to_string()
            })
        );
        assert_eq!(p.provider_reference.as_deref(), Some("ref-1"));
    }
}

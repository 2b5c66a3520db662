//! Uniform view over payments and payouts for the reconciliation pipeline.

use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use serde::{Deserialize, Serialize};

use crate::Metadata;
use crate::error::DomainError;
use crate::payment::Payment;
use crate::payout::Payout;
use crate::status::CanonicalStatus;

/// A record the engine reconciles against a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionRecord {
    Payment(Payment),
    Payout(Payout),
}

impl TransactionRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            TransactionRecord::Payment(_) => RecordKind::Payment,
            TransactionRecord::Payout(_) => RecordKind::Payout,
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            TransactionRecord::Payment(p) => p.id,
            TransactionRecord::Payout(p) => p.id,
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            TransactionRecord::Payment(p) => p.provider,
            TransactionRecord::Payout(p) => p.provider,
        }
    }

    pub fn status(&self) -> CanonicalStatus {
        match self {
            TransactionRecord::Payment(p) => p.status,
            TransactionRecord::Payout(p) => p.status,
        }
    }

    pub fn provider_reference(&self) -> Option<&str> {
        match self {
            TransactionRecord::Payment(p) => p.provider_reference.as_deref(),
            TransactionRecord::Payout(p) => p.provider_reference.as_deref(),
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            TransactionRecord::Payment(p) => p.version,
            TransactionRecord::Payout(p) => p.version,
        }
    }

    pub fn set_version(&mut self, version: i64) {
        match self {
            TransactionRecord::Payment(p) => p.version = version,
            TransactionRecord::Payout(p) => p.version = version,
        }
    }

    pub fn amount(&self) -> i64 {
        match self {
            TransactionRecord::Payment(p) => p.amount,
            TransactionRecord::Payout(p) => p.amount,
        }
    }

    pub fn currency(&self) -> &str {
        match self {
            TransactionRecord::Payment(p) => &p.currency,
            TransactionRecord::Payout(p) => &p.currency,
        }
    }

    pub fn booking_id(&self) -> &str {
        match self {
            TransactionRecord::Payment(p) => &p.booking_id,
            TransactionRecord::Payout(p) => &p.booking_id,
        }
    }

    /// User who receives status notifications, if known.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            TransactionRecord::Payment(p) => p.payer_user_id.as_deref(),
            TransactionRecord::Payout(p) => {
                Some(p.driver_id.as_str()).filter(|driver| !driver.is_empty())
            }
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TransactionRecord::Payment(p) => p.error_message.as_deref(),
            TransactionRecord::Payout(p) => p.error_message.as_deref(),
        }
    }

    pub fn set_error_message(&mut self, message: Option<String>) {
        match self {
            TransactionRecord::Payment(p) => p.error_message = message,
            TransactionRecord::Payout(p) => p.error_message = message,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            TransactionRecord::Payment(p) => &mut p.metadata,
            TransactionRecord::Payout(p) => &mut p.metadata,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TransactionRecord::Payment(p) => p.created_at,
            TransactionRecord::Payout(p) => p.created_at,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            TransactionRecord::Payment(p) => p.updated_at = at,
            TransactionRecord::Payout(p) => p.updated_at = at,
        }
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TransactionRecord::Payment(p) => p.last_checked_at,
            TransactionRecord::Payout(p) => p.last_checked_at,
        }
    }

    pub fn set_last_checked_at(&mut self, at: Option<DateTime<Utc>>) {
        match self {
            TransactionRecord::Payment(p) => p.last_checked_at = at,
            TransactionRecord::Payout(p) => p.last_checked_at = at,
        }
    }

    /// Instant the staleness threshold is measured from.
    pub fn staleness_anchor(&self) -> DateTime<Utc> {
        self.last_checked_at().unwrap_or_else(|| self.created_at())
    }

    pub fn transition_to(&mut self, next: CanonicalStatus) -> Result<(), DomainError> {
        match self {
            TransactionRecord::Payment(p) => p.transition_to(next),
            TransactionRecord::Payout(p) => p.transition_to(next),
        }
    }

    pub fn assign_reference(&mut self, reference: &str) -> Result<(), DomainError> {
        match self {
            TransactionRecord::Payment(p) => p.assign_reference(reference),
            TransactionRecord::Payout(p) => p.assign_reference(reference),
        }
    }

    pub fn as_payout(&self) -> Option<&Payout> {
        match self {
            TransactionRecord::Payout(p) => Some(p),
            TransactionRecord::Payment(_) => None,
        }
    }

    pub fn as_payout_mut(&mut self) -> Option<&mut Payout> {
        match self {
            TransactionRecord::Payout(p) => Some(p),
            TransactionRecord::Payment(_) => None,
        }
    }
}

impl From<Payment> for TransactionRecord {
    fn from(payment: Payment) -> Self {
        TransactionRecord::Payment(payment)
    }
}

impl From<Payout> for TransactionRecord {
    fn from(payout: Payout) -> Self {
        TransactionRecord::Payout(payout)
    }
}

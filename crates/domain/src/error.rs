//! Domain error types.

use common::RecordKind;
use thiserror::Error;

use crate::status::CanonicalStatus;

/// Errors raised when a record mutation would break one of its invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The requested status is not reachable from the current one.
    #[error("Invalid {kind} transition from {from} to {to}")]
    InvalidTransition {
        kind: RecordKind,
        from: CanonicalStatus,
        to: CanonicalStatus,
    },

    /// A provider reference is already recorded and differs from the new one.
    #[error("Provider reference already assigned: {existing}")]
    ReferenceAlreadyAssigned { existing: String },

    /// The payout already used every allowed retry.
    #[error("Retry limit of {max} reached")]
    RetryLimitReached { max: u32 },

    /// Retries only apply to payouts that are still in flight.
    #[error("Payout is {0}, retries require an in-flight payout")]
    NotInFlight(CanonicalStatus),
}

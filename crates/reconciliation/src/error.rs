//! Reconciliation error types.

use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, DomainError};
use providers::ProviderUnavailable;
use record_store::StoreError;
use thiserror::Error;

/// Errors that can occur while reconciling a record.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The requested status is not reachable from the stored one.
    #[error("Invalid {kind} transition for {record_id}: {from} -> {to}")]
    InvalidTransition {
        kind: RecordKind,
        record_id: RecordId,
        from: CanonicalStatus,
        to: CanonicalStatus,
    },

    /// The provider could not be reached or gave no usable answer.
    #[error("Provider {provider} unavailable: {source}")]
    ProviderUnavailable {
        provider: ProviderId,
        #[source]
        source: ProviderUnavailable,
    },

    /// The provider reported a status outside its known vocabulary.
    #[error("Unrecognised {provider} status '{native}'")]
    MappingAnomaly { provider: ProviderId, native: String },

    /// A conditional write kept losing to concurrent writers.
    #[error("Concurrent update of {kind} {record_id}")]
    StoreConflict { kind: RecordKind, record_id: RecordId },

    /// The record store failed.
    #[error("Record store error: {0}")]
    Store(#[source] StoreError),

    /// No record matches the given reference.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The provider definitively refused a payout retry.
    #[error("Provider refused retry of payout {record_id}: {reason_code}")]
    RetryRejected {
        record_id: RecordId,
        reason_code: String,
        raw: serde_json::Value,
    },

    /// A record mutation broke a domain invariant.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl ReconcileError {
    /// Returns true for failures that must abort a whole sweep or request
    /// rather than be reported against a single record.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_infrastructure())
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                kind, record_id, ..
            } => ReconcileError::StoreConflict { kind, record_id },
            other => ReconcileError::Store(other),
        }
    }
}

/// Convenience type alias for reconciliation results.
pub type Result<T> = std::result::Result<T, ReconcileError>;

//! Canonical status model shared by payments and payouts.

use std::str::FromStr;

use common::{ParseIdentifierError, RecordKind};
use serde::{Deserialize, Serialize};

/// Provider-independent lifecycle state of a payment or payout.
///
/// State transitions:
/// ```text
/// Pending ──► Processing ──┬──► Completed ──► Refunded (payments only)
///    │                     ├──► Failed
///    │                     └──► Cancelled
///    └──────────────► Completed | Failed | Cancelled
/// ```
///
/// A provider may report a final outcome before we ever observed the
/// intermediate `Processing` state, so `Pending` may move straight to any
/// outcome. No path passes through a terminal state except the single
/// `Completed ──► Refunded` edge for payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    /// Record created locally, provider has not acknowledged work yet.
    #[default]
    Pending,

    /// Provider acknowledged the request and is working on it.
    Processing,

    /// Funds moved (terminal).
    Completed,

    /// Provider definitively refused or failed the transaction (terminal).
    Failed,

    /// Transaction was cancelled before completion (terminal).
    Cancelled,

    /// A completed payment was returned to the payer (terminal).
    Refunded,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 6] = [
        CanonicalStatus::Pending,
        CanonicalStatus::Processing,
        CanonicalStatus::Completed,
        CanonicalStatus::Failed,
        CanonicalStatus::Cancelled,
        CanonicalStatus::Refunded,
    ];

    /// Statuses the reconciliation sweep keeps polling.
    pub const IN_FLIGHT: [CanonicalStatus; 2] =
        [CanonicalStatus::Pending, CanonicalStatus::Processing];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    /// Returns true while the provider may still change its answer.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CanonicalStatus::Pending | CanonicalStatus::Processing)
    }

    /// Returns true if a record of `kind` may move from `self` to `next`.
    ///
    /// Staying in the same status is not a transition and returns false.
    pub fn can_transition_to(&self, kind: RecordKind, next: CanonicalStatus) -> bool {
        use CanonicalStatus::*;

        match (self, next) {
            (Pending, Processing | Completed | Failed | Cancelled) => true,
            (Processing, Completed | Failed | Cancelled) => true,
            (Completed, Refunded) => kind == RecordKind::Payment,
            _ => false,
        }
    }

    /// Returns true if `self` is a status a record of `kind` can ever hold.
    pub fn applies_to(&self, kind: RecordKind) -> bool {
        !(kind == RecordKind::Payout && *self == CanonicalStatus::Refunded)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Pending => "pending",
            CanonicalStatus::Processing => "processing",
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Cancelled => "cancelled",
            CanonicalStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CanonicalStatus {
    type Err = ParseIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseIdentifierError {
                kind: "status",
                value: s.to_string(),
            })
    }
}

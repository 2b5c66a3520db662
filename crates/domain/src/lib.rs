//! Domain layer for payment/payout reconciliation.
//!
//! This crate provides the provider-independent core:
//! - Canonical status model and its transition graph
//! - Payment and Payout records with their invariants
//! - The pure payout retry policy and its reason-code allow-list

pub mod error;
pub mod payment;
pub mod payout;
pub mod record;
pub mod retry;
pub mod status;

/// Opaque provider-owned key/value payload kept for audit and debugging.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub use error::DomainError;
pub use payment::Payment;
pub use payout::{Payout, RetryAttempt};
pub use record::TransactionRecord;
pub use retry::{
    NoRetryReason, RETRYABLE_REASON_CODES, RetryDecision, RetryInput, RetryPolicy,
    is_retryable_reason,
};
pub use status::CanonicalStatus;

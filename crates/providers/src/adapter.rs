//! Capability interface every mobile-money network implements.

use async_trait::async_trait;
use common::{ProviderId, RecordId, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProviderResult;

/// Native status reported when the provider has no transaction under a reference.
pub const NATIVE_NOT_FOUND: &str = "NOT_FOUND";

/// Money movement to start at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateRequest {
    /// Collection for payments, disbursement for payouts.
    pub kind: RecordKind,
    /// Local record the movement belongs to; sent as the merchant-side id.
    pub record_id: RecordId,
    /// Transaction reference from [`ProviderAdapter::new_reference`]. A
    /// request sent again under the same reference names the same movement.
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    /// Payer for collections, payee for disbursements.
    pub phone: String,
    pub note: Option<String>,
}

/// Provider's answer to an `initiate` call it actually received.
#[derive(Debug, Clone, PartialEq)]
pub enum InitiateOutcome {
    /// Provider accepted the request under the requested reference.
    Accepted { reference: String, raw: Value },
    /// Provider definitively refused the request.
    Rejected { reason_code: String, raw: Value },
}

/// Provider's current view of an inbound payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCheck {
    pub native_status: String,
    pub raw: Value,
}

/// Provider's current view of an outbound payout.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutCheck {
    pub native_status: String,
    /// Provider failure code, present when the transfer failed.
    pub reason_code: Option<String>,
    pub raw: Value,
}

/// Uniform capability set over one external payment network.
///
/// Implementations own their authentication and transport. Every call either
/// returns the provider's definitive answer or [`crate::ProviderUnavailable`];
/// a transport problem is never reported as a provider-side failure.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The network this adapter talks to.
    fn provider(&self) -> ProviderId;

    /// Mints a transaction reference for a new `initiate`.
    ///
    /// The caller stores it before the call so an attempt whose answer was
    /// lost can be looked up or resent under the same reference.
    fn new_reference(&self) -> String;

    /// Starts a collection or disbursement.
    async fn initiate(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome>;

    /// Fetches the provider status of a collection.
    async fn check_payment_status(&self, reference: &str) -> ProviderResult<PaymentCheck>;

    /// Fetches the provider status of a disbursement.
    async fn check_payout_status(&self, reference: &str) -> ProviderResult<PayoutCheck>;
}

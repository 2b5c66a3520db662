//! Scriptable provider double for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::{ProviderId, RecordKind};
use domain::CanonicalStatus;
use serde_json::json;

use crate::adapter::{
    InitiateOutcome, InitiateRequest, NATIVE_NOT_FOUND, PaymentCheck, PayoutCheck,
    ProviderAdapter,
};
use crate::mapper::native_for;
use crate::{ProviderResult, ProviderUnavailable};

#[derive(Debug, Clone)]
struct ScriptedStatus {
    native: String,
    reason_code: Option<String>,
}

#[derive(Debug, Default)]
struct InMemoryProviderState {
    payments: HashMap<String, ScriptedStatus>,
    payouts: HashMap<String, ScriptedStatus>,
    initiated: Vec<InitiateRequest>,
    next_reference: u32,
    status_checks: usize,
    unavailable: bool,
    initiate_unavailable: bool,
    reject_initiate: Option<String>,
    delay: Option<Duration>,
}

/// In-memory provider whose answers are set by the test.
///
/// Unknown references are reported as [`NATIVE_NOT_FOUND`]. A reference
/// accepted by `initiate` starts out in the provider's first in-progress
/// value, and resending it does not start a second movement.
#[derive(Debug, Clone)]
pub struct InMemoryProviderAdapter {
    provider: ProviderId,
    state: Arc<RwLock<InMemoryProviderState>>,
}

impl InMemoryProviderAdapter {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            state: Arc::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryProviderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryProviderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the native status reported for a collection.
    pub fn set_payment_status(&self, reference: &str, native: &str) {
        self.write().payments.insert(
            reference.to_string(),
            ScriptedStatus {
                native: native.to_string(),
                reason_code: None,
            },
        );
    }

    /// Sets the native status and reason code reported for a disbursement.
    pub fn set_payout_status(&self, reference: &str, native: &str, reason_code: Option<&str>) {
        self.write().payouts.insert(
            reference.to_string(),
            ScriptedStatus {
                native: native.to_string(),
                reason_code: reason_code.map(String::from),
            },
        );
    }

    /// Makes every status check fail as unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    /// Makes `initiate` fail as unreachable.
    pub fn set_initiate_unavailable(&self, unavailable: bool) {
        self.write().initiate_unavailable = unavailable;
    }

    /// Makes `initiate` refuse requests with the given reason code.
    pub fn set_reject_initiate(&self, reason_code: Option<&str>) {
        self.write().reject_initiate = reason_code.map(String::from);
    }

    /// Delays every reply, for exercising caller-side timeouts. An `initiate`
    /// has already taken effect when its reply is held back.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.write().delay = delay;
    }

    /// Returns the number of distinct movements the provider accepted.
    pub fn initiate_count(&self) -> usize {
        self.read().initiated.len()
    }

    /// Returns the accepted `initiate` requests in call order.
    pub fn initiated_requests(&self) -> Vec<InitiateRequest> {
        self.read().initiated.clone()
    }

    /// Returns the number of status checks received.
    pub fn status_check_count(&self) -> usize {
        self.read().status_checks
    }

    fn prefix(&self) -> &'static str {
        match self.provider {
            ProviderId::MtnMomo => "MTN",
            ProviderId::AirtelMoney => "AIRTEL",
        }
    }

    async fn pause(&self) {
        let delay = self.read().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn accept(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome> {
        let mut state = self.write();

        if state.initiate_unavailable {
            return Err(ProviderUnavailable::Timeout);
        }
        if let Some(reason_code) = state.reject_initiate.clone() {
            return Ok(InitiateOutcome::Rejected {
                raw: json!({ "code": reason_code }),
                reason_code,
            });
        }

        let reference = request.reference.clone();
        let native = native_for(self.provider, CanonicalStatus::Processing)
            .unwrap_or("PENDING")
            .to_string();
        let table = match request.kind {
            RecordKind::Payment => &mut state.payments,
            RecordKind::Payout => &mut state.payouts,
        };
        if !table.contains_key(&reference) {
            table.insert(
                reference.clone(),
                ScriptedStatus {
                    native,
                    reason_code: None,
                },
            );
            state.initiated.push(request.clone());
        }

        Ok(InitiateOutcome::Accepted {
            raw: json!({ "reference": reference }),
            reference,
        })
    }

    fn lookup(&self, kind: RecordKind, reference: &str) -> ProviderResult<ScriptedStatus> {
        let mut state = self.write();
        state.status_checks += 1;
        if state.unavailable {
            return Err(ProviderUnavailable::Network("connection refused".into()));
        }

        let table = match kind {
            RecordKind::Payment => &state.payments,
            RecordKind::Payout => &state.payouts,
        };
        Ok(table
            .get(reference)
            .cloned()
            .unwrap_or_else(|| ScriptedStatus {
                native: NATIVE_NOT_FOUND.to_string(),
                reason_code: None,
            }))
    }
}

#[async_trait]
impl ProviderAdapter for InMemoryProviderAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn new_reference(&self) -> String {
        let mut state = self.write();
        state.next_reference += 1;
        format!("{}-{:04}", self.prefix(), state.next_reference)
    }

    async fn initiate(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome> {
        let outcome = self.accept(request);
        self.pause().await;
        outcome
    }

    async fn check_payment_status(&self, reference: &str) -> ProviderResult<PaymentCheck> {
        self.pause().await;
        let scripted = self.lookup(RecordKind::Payment, reference)?;
        Ok(PaymentCheck {
            raw: json!({ "status": scripted.native }),
            native_status: scripted.native,
        })
    }

    async fn check_payout_status(&self, reference: &str) -> ProviderResult<PayoutCheck> {
        self.pause().await;
        let scripted = self.lookup(RecordKind::Payout, reference)?;
        Ok(PayoutCheck {
            raw: json!({ "status": scripted.native, "reason": scripted.reason_code }),
            native_status: scripted.native,
            reason_code: scripted.reason_code,
        })
    }
}

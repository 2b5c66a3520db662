//! Payout retry policy.
//!
//! [`RetryPolicy::decide`] is a pure function of its inputs: the caller passes
//! the clock reading, so every decision is reproducible in tests.

use chrono::{DateTime, Duration, Utc};
use common::ProviderId;
use serde::{Deserialize, Serialize};

use crate::payout::Payout;
use crate::status::CanonicalStatus;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MIN_RETRY_DELAY_SECS: i64 = 300;

/// Provider reason codes that describe a transient failure worth re-initiating.
///
/// Everything absent from this table is treated as a definitive failure.
/// Codes are matched case-insensitively.
pub const RETRYABLE_REASON_CODES: &[(ProviderId, &str)] = &[
    // payer/payee did not approve before the request expired
    (ProviderId::MtnMomo, "EXPIRED"),
    // disbursement account temporarily short of float
    (ProviderId::MtnMomo, "NOT_ENOUGH_FUNDS"),
    (ProviderId::MtnMomo, "INTERNAL_PROCESSING_ERROR"),
    (ProviderId::MtnMomo, "SERVICE_UNAVAILABLE"),
    (ProviderId::MtnMomo, "COULD_NOT_PERFORM_TRANSACTION"),
    // insufficient balance
    (ProviderId::AirtelMoney, "DP00800001007"),
    // transaction timed out
    (ProviderId::AirtelMoney, "DP00800001024"),
    // transaction expired
    (ProviderId::AirtelMoney, "DP00800001029"),
];

/// Returns true if `reason_code` is on the provider's transient-failure allow-list.
pub fn is_retryable_reason(provider: ProviderId, reason_code: &str) -> bool {
    let code = reason_code.trim();
    RETRYABLE_REASON_CODES
        .iter()
        .any(|(p, c)| *p == provider && c.eq_ignore_ascii_case(code))
}

/// Why a failure will not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoRetryReason {
    /// The payout already reached a terminal status.
    Terminal,
    /// The reason code is absent or not on the allow-list.
    NonRetryableReason,
}

/// Outcome of evaluating a failed payout against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Re-initiate the payout now.
    RetryNow,
    /// Eligible, but the minimum delay since the last attempt has not elapsed.
    Deferred { due_at: DateTime<Utc> },
    /// Eligible reason, but every allowed retry is spent: fail terminally.
    Exhausted,
    /// Leave retries alone; the failure stands as reported.
    NoRetry(NoRetryReason),
}

/// Inputs to a single retry decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryInput<'a> {
    pub provider: ProviderId,
    pub status: CanonicalStatus,
    pub reason_code: Option<&'a str>,
    pub retry_count: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl<'a> RetryInput<'a> {
    /// Builds the input for a payout whose provider reported `reason_code`.
    pub fn for_payout(payout: &Payout, reason_code: Option<&'a str>, now: DateTime<Utc>) -> Self {
        Self {
            provider: payout.provider,
            status: payout.status,
            reason_code,
            retry_count: payout.retry_count,
            last_attempt_at: payout.last_attempt_at(),
            now,
        }
    }
}

/// Limits applied to payout retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: Duration::seconds(DEFAULT_MIN_RETRY_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, min_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
        }
    }

    /// Decides what to do about a payout the provider reported as failed.
    pub fn decide(&self, input: RetryInput<'_>) -> RetryDecision {
        if input.status.is_terminal() {
            return RetryDecision::NoRetry(NoRetryReason::Terminal);
        }

        let retryable = input
            .reason_code
            .is_some_and(|code| is_retryable_reason(input.provider, code));
        if !retryable {
            return RetryDecision::NoRetry(NoRetryReason::NonRetryableReason);
        }

        if input.retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }

        let due_at = input.last_attempt_at + self.min_delay;
        if input.now < due_at {
            return RetryDecision::Deferred { due_at };
        }

        RetryDecision::RetryNow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(retry_count: u32, minutes_ago: i64) -> RetryInput<'static> {
        let now = Utc::now();
        RetryInput {
            provider: ProviderId::MtnMomo,
            status: CanonicalStatus::Processing,
            reason_code: Some("EXPIRED"),
            retry_count,
            last_attempt_at: now - Duration::minutes(minutes_ago),
            now,
        }
    }

    #[test]
    fn retries_when_due() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(input(0, 10)), RetryDecision::RetryNow);
        assert_eq!(policy.decide(input(2, 5)), RetryDecision::RetryNow);
    }

    #[test]
    fn defers_inside_min_delay() {
        let policy = RetryPolicy::default();
        let i = input(1, 2);
        assert_eq!(
            policy.decide(i),
            RetryDecision::Deferred {
                due_at: i.last_attempt_at + Duration::minutes(5)
            }
        );
    }

    #[test]
    fn exhausted_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(input(3, 10)), RetryDecision::Exhausted);
        // exhaustion is reported even when the delay has not elapsed
        assert_eq!(policy.decide(input(3, 1)), RetryDecision::Exhausted);
    }

    #[test]
    fn non_retryable_reason_is_never_retried() {
        let policy = RetryPolicy::default();
        let mut i = input(0, 10);
        i.reason_code = Some("PAYEE_NOT_FOUND");
        assert_eq!(
            policy.decide(i),
            RetryDecision::NoRetry(NoRetryReason::NonRetryableReason)
        );
        i.reason_code = None;
        assert_eq!(
            policy.decide(i),
            RetryDecision::NoRetry(NoRetryReason::NonRetryableReason)
        );
    }

    #[test]
    fn terminal_status_is_never_retried() {
        let policy = RetryPolicy::default();
        for status in [
            CanonicalStatus::Completed,
            CanonicalStatus::Failed,
            CanonicalStatus::Cancelled,
        ] {
            let mut i = input(0, 10);
            i.status = status;
            assert_eq!(policy.decide(i), RetryDecision::NoRetry(NoRetryReason::Terminal));
        }
    }

    #[test]
    fn allow_list_is_provider_namespaced() {
        assert!(is_retryable_reason(ProviderId::MtnMomo, "expired"));
        assert!(!is_retryable_reason(ProviderId::AirtelMoney, "EXPIRED"));
        assert!(is_retryable_reason(ProviderId::AirtelMoney, "DP00800001024"));
        assert!(!is_retryable_reason(ProviderId::MtnMomo, "DP00800001024"));
    }

    #[test]
    fn custom_limits() {
        let policy = RetryPolicy::new(1, Duration::seconds(30));
        assert_eq!(policy.decide(input(0, 1)), RetryDecision::RetryNow);
        assert_eq!(policy.decide(input(1, 10)), RetryDecision::Exhausted);
    }
}

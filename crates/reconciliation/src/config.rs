use std::time::Duration;

use domain::RetryPolicy;

/// Engine settings injected by the binary.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// In-flight records unchecked for this long are picked up by a sweep.
    pub stale_after: chrono::Duration,
    /// Maximum records selected per kind in one sweep.
    pub batch_limit: usize,
    /// Records reconciled at once within a sweep, across kinds and providers.
    pub concurrency: usize,
    /// Deadline for a single provider call.
    pub provider_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(5),
            batch_limit: 500,
            concurrency: 16,
            provider_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
        }
    }
}

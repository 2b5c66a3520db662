//! Reconciliation engine for mobile-money payments and payouts.
//!
//! Brings locally recorded payments and payouts in line with what the
//! provider reports:
//! - [`OrchestrationService`] is the only writer of status changes
//! - [`NotificationGate`] sends at most one notification per settled status
//! - [`PayoutRetrier`] re-initiates failed payouts the retry policy allows
//! - [`Reconciler`] runs the per-record pipeline
//! - [`ReconciliationScheduler`] sweeps stale records with bounded concurrency
//! - [`OnDemandStatus`] answers a single payment status request

pub mod config;
pub mod error;
pub mod notification;
pub mod on_demand;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod scheduler;

pub use config::ReconcileConfig;
pub use error::{ReconcileError, Result};
pub use notification::{
    DispatchError, InMemoryNotificationDispatcher, NotificationDispatcher, NotificationGate,
    NotificationKind, NotifyOutcome, SentNotification, TracingNotificationDispatcher,
    notification_payload,
};
pub use on_demand::{OnDemandStatus, StatusRequest, StatusView, status_message};
pub use orchestrator::{ApplyOutcome, LAST_PROVIDER_RESPONSE, OrchestrationService, StatusContext};
pub use reconciler::{RecordOutcome, RecordResult, Reconciler};
pub use retry::{LAST_RETRY_RESPONSE, PayoutRetrier};
pub use scheduler::{KindReport, ReconciliationScheduler, SweepReport};

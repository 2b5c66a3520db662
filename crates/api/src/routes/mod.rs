//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod payments;
pub mod payouts;
pub mod reconciliation;

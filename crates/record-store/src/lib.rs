//! Transactional record store for the reconciliation engine.
//!
//! Holds payments, payouts and notification dedup markers. Both backends give
//! every status write compare-and-swap semantics on the record version.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryNotificationLog, InMemoryRecordStore};
pub use postgres::{PostgresNotificationLog, PostgresRecordStore};
pub use query::StaleQuery;
pub use store::{NotificationLog, NotificationMarker, RecordStore, RecordStoreExt};

//! Identifiers shared across the reconciliation workspace.

pub mod types;

pub use types::{ParseIdentifierError, ProviderId, RecordId, RecordKind};

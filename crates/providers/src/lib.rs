//! Mobile-money provider integrations.
//!
//! - [`ProviderAdapter`]: uniform `initiate` / status-check capability per network
//! - [`mapper`]: native status vocabularies and their canonical mapping
//! - [`MtnMomoAdapter`] and [`AirtelMoneyAdapter`]: HTTP implementations
//! - [`InMemoryProviderAdapter`]: scriptable double
//! - [`ProviderRegistry`]: adapter lookup by [`common::ProviderId`]

pub mod adapter;
pub mod airtel;
pub mod error;
pub mod in_memory;
pub mod mapper;
pub mod mtn;
pub mod registry;
mod transport;

pub use adapter::{
    InitiateOutcome, InitiateRequest, NATIVE_NOT_FOUND, PaymentCheck, PayoutCheck,
    ProviderAdapter,
};
pub use airtel::{AirtelMoneyAdapter, AirtelMoneyConfig};
pub use error::{ProviderResult, ProviderUnavailable};
pub use in_memory::InMemoryProviderAdapter;
pub use mapper::{MappedStatus, map_status};
pub use mtn::{MtnMomoAdapter, MtnMomoConfig, MtnProductCredentials};
pub use registry::ProviderRegistry;

//! Translation of provider-native status strings into the canonical model.
//!
//! Each provider has one table listing every value of its vocabulary. Lookup
//! trims and ignores case; anything outside the table is [`MappedStatus::Unknown`].

use common::ProviderId;
use domain::CanonicalStatus;

/// Result of mapping a native status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedStatus {
    Canonical(CanonicalStatus),
    /// Value outside the provider's vocabulary. Treated as "no change".
    Unknown,
}

impl MappedStatus {
    pub fn canonical(self) -> Option<CanonicalStatus> {
        match self {
            MappedStatus::Canonical(status) => Some(status),
            MappedStatus::Unknown => None,
        }
    }
}

pub const MTN_MOMO_STATUSES: &[(&str, CanonicalStatus)] = &[
    ("CREATED", CanonicalStatus::Pending),
    ("PENDING", CanonicalStatus::Processing),
    ("ONGOING", CanonicalStatus::Processing),
    ("SUCCESSFUL", CanonicalStatus::Completed),
    ("FAILED", CanonicalStatus::Failed),
    ("REJECTED", CanonicalStatus::Failed),
    ("TIMEOUT", CanonicalStatus::Failed),
];

pub const AIRTEL_MONEY_STATUSES: &[(&str, CanonicalStatus)] = &[
    ("TIP", CanonicalStatus::Processing),
    ("TA", CanonicalStatus::Processing),
    ("TS", CanonicalStatus::Completed),
    ("TF", CanonicalStatus::Failed),
    ("TE", CanonicalStatus::Failed),
];

/// The full native vocabulary of `provider`.
pub fn vocabulary(provider: ProviderId) -> &'static [(&'static str, CanonicalStatus)] {
    match provider {
        ProviderId::MtnMomo => MTN_MOMO_STATUSES,
        ProviderId::AirtelMoney => AIRTEL_MONEY_STATUSES,
    }
}

/// Maps a native status reported by `provider`.
pub fn map_status(provider: ProviderId, native: &str) -> MappedStatus {
    let native = native.trim();
    vocabulary(provider)
        .iter()
        .find(|(value, _)| value.eq_ignore_ascii_case(native))
        .map(|(_, status)| MappedStatus::Canonical(*status))
        .unwrap_or(MappedStatus::Unknown)
}

/// First native value `provider` uses for `status`, if any.
pub fn native_for(provider: ProviderId, status: CanonicalStatus) -> Option<&'static str> {
    vocabulary(provider)
        .iter()
        .find(|(_, canonical)| *canonical == status)
        .map(|(value, _)| *value)
}

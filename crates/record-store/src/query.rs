use chrono::{DateTime, Duration, Utc};
use common::{ProviderId, RecordKind};

/// Selection of in-flight records that are due for a provider check.
///
/// A record is stale when it is `pending` or `processing` and its last check
/// (or its creation, if never checked) is strictly older than `cutoff`.
/// Results are ordered oldest first.
#[derive(Debug, Clone)]
pub struct StaleQuery {
    pub kind: RecordKind,
    pub cutoff: DateTime<Utc>,
    pub provider: Option<ProviderId>,
    pub limit: Option<usize>,
}

impl StaleQuery {
    /// Records of `kind` not checked since `cutoff`.
    pub fn new(kind: RecordKind, cutoff: DateTime<Utc>) -> Self {
        Self {
            kind,
            cutoff,
            provider: None,
            limit: None,
        }
    }

    /// Records of `kind` not checked within `stale_after` of `now`.
    pub fn older_than(kind: RecordKind, now: DateTime<Utc>, stale_after: Duration) -> Self {
        Self::new(kind, now - stale_after)
    }

    /// Restricts the selection to one provider.
    pub fn provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Limits the number of records returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_than_subtracts_threshold() {
        let now = Utc::now();
        let q = StaleQuery::older_than(RecordKind::Payout, now, Duration::minutes(5));
        assert_eq!(q.cutoff, now - Duration::minutes(5));
        assert_eq!(q.kind, RecordKind::Payout);
        assert!(q.limit.is_none());
    }

    #[test]
    fn builder_sets_filters() {
        let q = StaleQuery::new(RecordKind::Payment, Utc::now())
            .provider(ProviderId::AirtelMoney)
            .limit(50);
        assert_eq!(q.provider, Some(ProviderId::AirtelMoney));
        assert_eq!(q.limit, Some(50));
    }
}

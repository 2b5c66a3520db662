//! Periodic sweep over stale in-flight records.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{ProviderId, RecordKind};
use domain::TransactionRecord;
use futures_util::{StreamExt, TryStreamExt, stream};
use record_store::StaleQuery;
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::reconciler::{RecordOutcome, RecordResult, Reconciler};

/// Sweep results for one record kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindReport {
    pub checked: usize,
    pub results: Vec<RecordResult>,
}

impl KindReport {
    /// Number of results with the given outcome.
    pub fn count(&self, outcome: RecordOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Per-record results of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub payments: KindReport,
    pub payouts: KindReport,
    /// Owed notifications from earlier failed dispatches that went out.
    pub notifications_redelivered: usize,
}

/// Drives reconciliation sweeps.
///
/// Stale payments and payouts are selected together and processed as one
/// batch, at most `concurrency` records at a time, with providers interleaved
/// so one provider's backlog does not hold back the others. Sweeps may
/// overlap: every write underneath is conditional.
#[derive(Clone)]
pub struct ReconciliationScheduler {
    reconciler: Arc<Reconciler>,
}

impl ReconciliationScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Runs one sweep over stale payments and payouts, then retries owed
    /// notifications.
    #[tracing::instrument(skip(self))]
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let started = Instant::now();
        metrics::counter!("reconciliation_sweeps_total").increment(1);
        let now = Utc::now();

        let (payments, payouts) = futures_util::try_join!(
            self.select(RecordKind::Payment, now),
            self.select(RecordKind::Payout, now),
        )?;
        let results = self
            .process(interleave_providers(payments.into_iter().chain(payouts)), now)
            .await?;

        let mut report = SweepReport::default();
        for (kind, result) in results {
            let part = match kind {
                RecordKind::Payment => &mut report.payments,
                RecordKind::Payout => &mut report.payouts,
            };
            part.checked += 1;
            part.results.push(result);
        }

        let config = self.reconciler.config();
        report.notifications_redelivered = self
            .reconciler
            .gate()
            .redeliver(self.reconciler.store().as_ref(), Utc::now(), config.batch_limit)
            .await?;

        metrics::histogram!("reconciliation_sweep_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            payments = report.payments.checked,
            payouts = report.payouts.checked,
            redelivered = report.notifications_redelivered,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn select(&self, kind: RecordKind, now: DateTime<Utc>) -> Result<Vec<TransactionRecord>> {
        let config = self.reconciler.config();
        let query =
            StaleQuery::older_than(kind, now, config.stale_after).limit(config.batch_limit);
        let stale = self.reconciler.store().find_stale(query).await?;
        tracing::debug!(kind = %kind, count = stale.len(), "stale records selected");
        Ok(stale)
    }

    /// Reconciles `records` with bounded concurrency, returning results in
    /// input order.
    async fn process(
        &self,
        records: Vec<TransactionRecord>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(RecordKind, RecordResult)>> {
        let concurrency = self.reconciler.config().concurrency.max(1);

        let mut results: Vec<(usize, RecordKind, RecordResult)> =
            stream::iter(records.into_iter().enumerate())
                .map(|(index, record)| async move {
                    let kind = record.kind();
                    let result = self.reconciler.reconcile_record(record, now).await?;
                    Ok::<_, ReconcileError>((index, kind, result))
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;

        results.sort_by_key(|(index, _, _)| *index);
        Ok(results
            .into_iter()
            .map(|(_, kind, result)| (kind, result))
            .collect())
    }
}

/// Orders records round-robin across providers, in [`ProviderId::ALL`]
/// order, keeping each provider's records in their original order.
fn interleave_providers(
    records: impl IntoIterator<Item = TransactionRecord>,
) -> Vec<TransactionRecord> {
    let mut groups: Vec<(ProviderId, std::collections::VecDeque<TransactionRecord>)> =
        ProviderId::ALL.iter().map(|p| (*p, Default::default())).collect();
    let mut total = 0;
    for record in records {
        if let Some((_, group)) = groups.iter_mut().find(|(p, _)| *p == record.provider()) {
            group.push_back(record);
            total += 1;
        }
    }

    let mut ordered = Vec::with_capacity(total);
    while ordered.len() < total {
        for (_, group) in groups.iter_mut() {
            if let Some(record) = group.pop_front() {
                ordered.push(record);
            }
        }
    }
    ordered
}

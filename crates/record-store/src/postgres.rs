use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProviderId, RecordId, RecordKind};
use domain::{CanonicalStatus, Metadata, Payment, Payout, RetryAttempt, TransactionRecord};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{NotificationLog, NotificationMarker, RecordStore, Result, StaleQuery, StoreError};

const PAYMENT_COLUMNS: &str = "id, provider, provider_reference, status, amount, currency, \
     booking_id, payer_user_id, metadata, error_message, created_at, updated_at, \
     last_checked_at, version";

const PAYOUT_COLUMNS: &str = "id, provider, provider_reference, status, amount, currency, \
     destination_phone, payment_id, booking_id, driver_id, retry_count, retry_history, \
     last_retry_at, pending_retry_reference, max_retries_reached, metadata, error_message, \
     created_at, updated_at, last_checked_at, version";

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Creates a new PostgreSQL record store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn table(kind: RecordKind) -> &'static str {
        match kind {
            RecordKind::Payment => "payments",
            RecordKind::Payout => "payouts",
        }
    }

    fn columns(kind: RecordKind) -> &'static str {
        match kind {
            RecordKind::Payment => PAYMENT_COLUMNS,
            RecordKind::Payout => PAYOUT_COLUMNS,
        }
    }

    fn row_to_record(kind: RecordKind, row: &PgRow) -> Result<TransactionRecord> {
        Ok(match kind {
            RecordKind::Payment => TransactionRecord::Payment(Self::row_to_payment(row)?),
            RecordKind::Payout => TransactionRecord::Payout(Self::row_to_payout(row)?),
        })
    }

    fn row_to_payment(row: &PgRow) -> Result<Payment> {
        Ok(Payment {
            id: RecordId::from_uuid(row.try_get::<Uuid, _>("id")?),
            provider: parse_provider(row.try_get("provider")?)?,
            provider_reference: row.try_get("provider_reference")?,
            status: parse_status(row.try_get("status")?)?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            booking_id: row.try_get("booking_id")?,
            payer_user_id: row.try_get("payer_user_id")?,
            metadata: serde_json::from_value::<Metadata>(row.try_get("metadata")?)?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_checked_at: row.try_get("last_checked_at")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_payout(row: &PgRow) -> Result<Payout> {
        let retry_count: i32 = row.try_get("retry_count")?;
        let retry_count = u32::try_from(retry_count)
            .map_err(|_| StoreError::Corrupt(format!("negative retry_count {retry_count}")))?;

        Ok(Payout {
            id: RecordId::from_uuid(row.try_get::<Uuid, _>("id")?),
            provider: parse_provider(row.try_get("provider")?)?,
            provider_reference: row.try_get("provider_reference")?,
            status: parse_status(row.try_get("status")?)?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            destination_phone: row.try_get("destination_phone")?,
            payment_id: RecordId::from_uuid(row.try_get::<Uuid, _>("payment_id")?),
            booking_id: row.try_get("booking_id")?,
            driver_id: row.try_get("driver_id")?,
            retry_count,
            retry_history: serde_json::from_value::<Vec<RetryAttempt>>(
                row.try_get("retry_history")?,
            )?,
            last_retry_at: row.try_get("last_retry_at")?,
            pending_retry_reference: row.try_get("pending_retry_reference")?,
            max_retries_reached: row.try_get("max_retries_reached")?,
            metadata: serde_json::from_value::<Metadata>(row.try_get("metadata")?)?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_checked_at: row.try_get("last_checked_at")?,
            version: row.try_get("version")?,
        })
    }

    async fn insert_payment(&self, p: &Payment) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, provider, provider_reference, status, amount, currency,
                booking_id, payer_user_id, metadata, error_message, created_at, updated_at,
                last_checked_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(p.id.as_uuid())
        .bind(p.provider.as_str())
        .bind(&p.provider_reference)
        .bind(p.status.as_str())
        .bind(p.amount)
        .bind(&p.currency)
        .bind(&p.booking_id)
        .bind(&p.payer_user_id)
        .bind(serde_json::Value::Object(p.metadata.clone()))
        .bind(&p.error_message)
        .bind(p.created_at)
        .bind(p.updated_at)
        .bind(p.last_checked_at)
        .bind(p.version)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn insert_payout(&self, p: &Payout) -> Result<()> {
        let retry_history = serde_json::to_value(&p.retry_history)?;
        sqlx::query(
            r#"
            INSERT INTO payouts (id, provider, provider_reference, status, amount, currency,
                destination_phone, payment_id, booking_id, driver_id, retry_count, retry_history,
                last_retry_at, pending_retry_reference, max_retries_reached, metadata,
                error_message, created_at, updated_at, last_checked_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21)
            "#,
        )
        .bind(p.id.as_uuid())
        .bind(p.provider.as_str())
        .bind(&p.provider_reference)
        .bind(p.status.as_str())
        .bind(p.amount)
        .bind(&p.currency)
        .bind(&p.destination_phone)
        .bind(p.payment_id.as_uuid())
        .bind(&p.booking_id)
        .bind(&p.driver_id)
        .bind(retry_count_column(p.retry_count)?)
        .bind(retry_history)
        .bind(p.last_retry_at)
        .bind(&p.pending_retry_reference)
        .bind(p.max_retries_reached)
        .bind(serde_json::Value::Object(p.metadata.clone()))
        .bind(&p.error_message)
        .bind(p.created_at)
        .bind(p.updated_at)
        .bind(p.last_checked_at)
        .bind(p.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_payment(&self, p: &Payment, expected_version: i64) -> Result<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE payments
            SET provider_reference = $3, status = $4, metadata = $5, error_message = $6,
                updated_at = $7, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(p.id.as_uuid())
        .bind(expected_version)
        .bind(&p.provider_reference)
        .bind(p.status.as_str())
        .bind(serde_json::Value::Object(p.metadata.clone()))
        .bind(&p.error_message)
        .bind(p.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    async fn update_payout(&self, p: &Payout, expected_version: i64) -> Result<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE payouts
            SET provider_reference = $3, status = $4, retry_count = $5, retry_history = $6,
                last_retry_at = $7, pending_retry_reference = $8, max_retries_reached = $9,
                metadata = $10, error_message = $11, updated_at = $12, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(p.id.as_uuid())
        .bind(expected_version)
        .bind(&p.provider_reference)
        .bind(p.status.as_str())
        .bind(retry_count_column(p.retry_count)?)
        .bind(serde_json::to_value(&p.retry_history)?)
        .bind(p.last_retry_at)
        .bind(&p.pending_retry_reference)
        .bind(p.max_retries_reached)
        .bind(serde_json::Value::Object(p.metadata.clone()))
        .bind(&p.error_message)
        .bind(p.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }
}

fn parse_provider(value: String) -> Result<ProviderId> {
    value
        .parse()
        .map_err(|e: common::ParseIdentifierError| StoreError::Corrupt(e.to_string()))
}

fn parse_status(value: String) -> Result<CanonicalStatus> {
    value
        .parse()
        .map_err(|e: common::ParseIdentifierError| StoreError::Corrupt(e.to_string()))
}

fn retry_count_column(count: u32) -> Result<i32> {
    i32::try_from(count).map_err(|_| StoreError::Corrupt(format!("retry_count {count} overflows")))
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn insert(&self, record: TransactionRecord) -> Result<()> {
        let kind = record.kind();
        let record_id = record.id();
        let result = match &record {
            TransactionRecord::Payment(p) => self.insert_payment(p).await.map_err(StoreError::from),
            TransactionRecord::Payout(p) => self.insert_payout(p).await,
        };

        result.map_err(|e| match e {
            StoreError::Database(sqlx::Error::Database(ref db_err))
                if db_err.is_unique_violation() =>
            {
                StoreError::Duplicate { kind, record_id }
            }
            other => other,
        })
    }

    async fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<TransactionRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::columns(kind),
            Self::table(kind)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_record(kind, &r)).transpose()
    }

    async fn find_by_reference(
        &self,
        kind: RecordKind,
        provider: ProviderId,
        reference: &str,
    ) -> Result<Option<TransactionRecord>> {
        let sql = match kind {
            RecordKind::Payment => format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments \
                 WHERE provider = $1 AND provider_reference = $2 LIMIT 1"
            ),
            RecordKind::Payout => format!(
                "SELECT {PAYOUT_COLUMNS} FROM payouts \
                 WHERE provider = $1 AND (provider_reference = $2 OR EXISTS ( \
                     SELECT 1 FROM jsonb_array_elements(retry_history) AS h \
                     WHERE h->>'new_reference' = $2 OR h->>'previous_reference' = $2)) \
                 ORDER BY (provider_reference IS NOT DISTINCT FROM $2) DESC \
                 LIMIT 1"
            ),
        };

        let row = sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_record(kind, &r)).transpose()
    }

    async fn find_stale(&self, query: StaleQuery) -> Result<Vec<TransactionRecord>> {
        let sql = format!(
            "SELECT {} FROM {} \
             WHERE status IN ('pending', 'processing') \
               AND COALESCE(last_checked_at, created_at) < $1 \
               AND ($2::text IS NULL OR provider = $2) \
             ORDER BY COALESCE(last_checked_at, created_at), id \
             LIMIT $3",
            Self::columns(query.kind),
            Self::table(query.kind)
        );

        let limit = query.limit.map(|l| l as i64);
        let rows = sqlx::query(&sql)
            .bind(query.cutoff)
            .bind(query.provider.map(|p| p.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Self::row_to_record(query.kind, r))
            .collect()
    }

    #[tracing::instrument(skip(self, record), fields(kind = %record.kind(), record_id = %record.id()))]
    async fn update(&self, record: &TransactionRecord, expected_version: i64) -> Result<i64> {
        let updated = match record {
            TransactionRecord::Payment(p) => self.update_payment(p, expected_version).await?,
            TransactionRecord::Payout(p) => self.update_payout(p, expected_version).await?,
        };

        if let Some(version) = updated {
            return Ok(version);
        }

        let kind = record.kind();
        let sql = format!("SELECT version FROM {} WHERE id = $1", Self::table(kind));
        let actual: Option<i64> = sqlx::query_scalar(&sql)
            .bind(record.id().as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match actual {
            Some(actual) => {
                metrics::counter!("store_conflicts_total", "kind" => kind.as_str()).increment(1);
                Err(StoreError::Conflict {
                    kind,
                    record_id: record.id(),
                    expected: expected_version,
                    actual,
                })
            }
            None => Err(StoreError::NotFound {
                kind,
                record_id: record.id(),
            }),
        }
    }

    async fn mark_checked(&self, kind: RecordKind, id: RecordId, at: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_checked_at = GREATEST(COALESCE(last_checked_at, $2), $2) \
             WHERE id = $1",
            Self::table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                record_id: id,
            });
        }
        Ok(())
    }
}

/// PostgreSQL-backed notification dedup ledger.
#[derive(Clone)]
pub struct PostgresNotificationLog {
    pool: PgPool,
}

impl PostgresNotificationLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_marker(row: &PgRow) -> Result<NotificationMarker> {
        let record_kind = match row.try_get::<String, _>("record_kind")?.as_str() {
            "payment" => RecordKind::Payment,
            "payout" => RecordKind::Payout,
            other => return Err(StoreError::Corrupt(format!("unknown record kind {other}"))),
        };

        Ok(NotificationMarker {
            record_id: RecordId::from_uuid(row.try_get::<Uuid, _>("record_id")?),
            record_kind,
            status: parse_status(row.try_get("status")?)?,
            notification_kind: row.try_get("notification_kind")?,
            recipient: row.try_get("recipient")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }
}

#[async_trait]
impl NotificationLog for PostgresNotificationLog {
    async fn try_record(&self, marker: &NotificationMarker) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_markers
                (record_id, status, record_kind, notification_kind, recipient, sent_at,
                 delivered_at, claimed_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (record_id, status) DO NOTHING
            "#,
        )
        .bind(marker.record_id.as_uuid())
        .bind(marker.status.as_str())
        .bind(marker.record_kind.as_str())
        .bind(&marker.notification_kind)
        .bind(&marker.recipient)
        .bind(marker.sent_at)
        .bind(marker.delivered_at)
        .bind(marker.claimed_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn exists(&self, record_id: RecordId, status: CanonicalStatus) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notification_markers WHERE record_id = $1 AND status = $2)",
        )
        .bind(record_id.as_uuid())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_delivered(
        &self,
        record_id: RecordId,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE notification_markers SET delivered_at = COALESCE(delivered_at, $3) \
             WHERE record_id = $1 AND status = $2",
        )
        .bind(record_id.as_uuid())
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, record_id: RecordId, status: CanonicalStatus) -> Result<()> {
        sqlx::query(
            "UPDATE notification_markers SET claimed_until = sent_at \
             WHERE record_id = $1 AND status = $2 AND delivered_at IS NULL",
        )
        .bind(record_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_undelivered(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMarker>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = sqlx::query(
            r#"
            UPDATE notification_markers m
            SET claimed_until = $2
            FROM (
                SELECT record_id, status FROM notification_markers
                WHERE delivered_at IS NULL AND claimed_until <= $1
                ORDER BY sent_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE m.record_id = due.record_id AND m.status = due.status
            RETURNING m.record_id, m.status, m.record_kind, m.notification_kind, m.recipient,
                m.sent_at, m.delivered_at, m.claimed_until
            "#,
        )
        .bind(now)
        .bind(until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::row_to_marker)
        .collect::<Result<Vec<_>>>()?;

        rows.sort_by_key(|m| m.sent_at);
        Ok(rows)
    }

    async fn markers_for(&self, record_id: RecordId) -> Result<Vec<NotificationMarker>> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, status, record_kind, notification_kind, recipient, sent_at,
                delivered_at, claimed_until
            FROM notification_markers
            WHERE record_id = $1
            ORDER BY sent_at
            "#,
        )
        .bind(record_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_marker).collect()
    }
}

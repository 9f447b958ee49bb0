use super::{ClaimOutcome, IdempotencyRecord, IdempotencyStore};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "idempotency_key, claim_token, status, payload_hash, response_data, \
     error_message, created_at, expires_at, in_progress_expires_at, completed_at";

/// PostgreSQL-based idempotency storage.
///
/// The primary key on `idempotency_key` enforces one record per key; the
/// claim is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE` that only
/// overwrites stale rows and reports a conflict as
/// `AlreadyExists(None)`, leaving the read to the caller. Expiry is lazy,
/// see [`purge_expired`](IdempotencyStore::purge_expired).
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Counts records by stored status.
    pub async fn count_by_status(&self, status: super::IdempotencyStatus) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_records (idempotency_key, claim_token, status, payload_hash, response_data, error_message, created_at, expires_at, in_progress_expires_at, completed_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, $5, $6, $7, NULL)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                claim_token = EXCLUDED.claim_token,
                status = EXCLUDED.status,
                payload_hash = EXCLUDED.payload_hash,
                response_data = NULL,
                error_message = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                in_progress_expires_at = EXCLUDED.in_progress_expires_at,
                completed_at = NULL
            WHERE idempotency_records.expires_at < $8
               OR idempotency_records.status = 'FAILED'
               OR (idempotency_records.status = 'INPROGRESS' AND idempotency_records.in_progress_expires_at < $8)
            RETURNING claim_token
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(record.claim_token)
        .bind(record.status)
        .bind(&record.payload_hash)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.in_progress_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        // ON CONFLICT cannot return the row it refused to overwrite
        match claimed {
            Some((token,)) if token == record.claim_token => Ok(ClaimOutcome::Claimed),
            _ => Ok(ClaimOutcome::AlreadyExists(None)),
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            "SELECT {} FROM idempotency_records WHERE idempotency_key = $1",
            RECORD_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn complete_record(
        &self,
        key: &str,
        claim_token: Uuid,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'COMPLETED', response_data = $3, expires_at = $4, completed_at = NOW()
            WHERE idempotency_key = $1 AND claim_token = $2 AND status = 'INPROGRESS'
            "#,
        )
        .bind(key)
        .bind(claim_token)
        .bind(response)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_record(
        &self,
        key: &str,
        claim_token: Uuid,
        error_message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'FAILED', error_message = $3, expires_at = $4, completed_at = NOW()
            WHERE idempotency_key = $1 AND claim_token = $2 AND status = 'INPROGRESS'
            "#,
        )
        .bind(key)
        .bind(claim_token)
        .bind(error_message)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_record(&self, key: &str, claim_token: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE idempotency_key = $1 AND claim_token = $2
            "#,
        )
        .bind(key)
        .bind(claim_token)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

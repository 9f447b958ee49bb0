pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::InMemoryIdempotencyStore;
pub use self::postgres::PostgresIdempotencyStore;
pub use self::redis::RedisIdempotencyStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status of an idempotency record.
///
/// `Expired` is never written; it is derived from `expires_at` when a record is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    /// Only written when failed attempts are persisted; claimable like an absent record.
    Failed,
    Expired,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "INPROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
            IdempotencyStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INPROGRESS" => Some(IdempotencyStatus::InProgress),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            "EXPIRED" => Some(IdempotencyStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored idempotency record, one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    /// Identifies the claim that created the record; completion and release are conditional on it.
    pub claim_token: Uuid,
    pub status: IdempotencyStatus,
    pub payload_hash: String,
    pub response_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Backstop after which another caller may reclaim an IN_PROGRESS record.
    pub in_progress_expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// Builds a fresh IN_PROGRESS claim.
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        payload_hash: impl Into<String>,
        now: DateTime<Utc>,
        expiration: Duration,
        in_progress_expiration: Duration,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            claim_token: Uuid::new_v4(),
            status: IdempotencyStatus::InProgress,
            payload_hash: payload_hash.into(),
            response_data: None,
            error_message: None,
            created_at: now,
            expires_at: now + expiration,
            in_progress_expires_at: now + in_progress_expiration,
            completed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_in_progress_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::InProgress && now > self.in_progress_expires_at
    }

    /// Status as observed at `now`, with expiry applied.
    pub fn status_at(&self, now: DateTime<Utc>) -> IdempotencyStatus {
        if self.is_expired(now) {
            IdempotencyStatus::Expired
        } else {
            self.status
        }
    }

    /// Whether a new claim may overwrite this record.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now)
            || self.status == IdempotencyStatus::Failed
            || self.is_in_progress_expired(now)
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == IdempotencyStatus::Failed
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the key.
    Claimed,
    /// A live record exists. `None` when the backend could not return it in
    /// the same atomic step and it has to be read separately.
    AlreadyExists(Option<IdempotencyRecord>),
}

/// Durable key to record store.
///
/// Every mutation is a single atomic conditional operation against the
/// backend; no method may be implemented as a read followed by a write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Inserts `record` unless a live record exists for its key. Expired,
    /// failed and timed-out in-progress records are overwritten.
    async fn put_if_absent(&self, record: &IdempotencyRecord, now: DateTime<Utc>)
        -> Result<ClaimOutcome>;

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// IN_PROGRESS to COMPLETED. Returns false when `claim_token` no longer owns the record.
    async fn complete_record(
        &self,
        key: &str,
        claim_token: Uuid,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// IN_PROGRESS to FAILED. Returns false when `claim_token` no longer owns the record.
    async fn fail_record(
        &self,
        key: &str,
        claim_token: Uuid,
        error_message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Removes the record if `claim_token` still owns it.
    async fn delete_record(&self, key: &str, claim_token: Uuid) -> Result<bool>;

    /// Physically removes expired records. Backends with native TTL return 0.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

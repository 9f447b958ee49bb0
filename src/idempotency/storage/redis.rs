use super::{ClaimOutcome, IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use uuid::Uuid;

/// Claims the key unless a live record exists. Returns an empty array on
/// success and the existing hash otherwise.
const CLAIM_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status then
    local now = tonumber(ARGV[1])
    local expires_at = tonumber(redis.call('HGET', KEYS[1], 'expires_at'))
    local in_progress_expires_at = tonumber(redis.call('HGET', KEYS[1], 'in_progress_expires_at'))
    local stale = (expires_at ~= nil and expires_at < now)
        or status == 'FAILED'
        or (status == 'INPROGRESS' and in_progress_expires_at ~= nil and in_progress_expires_at < now)
    if not stale then
        return redis.call('HGETALL', KEYS[1])
    end
    redis.call('DEL', KEYS[1])
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('PEXPIREAT', KEYS[1], ARGV[2])
return {}
"#;

/// Moves an owned IN_PROGRESS record to a final status.
const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'claim_token') ~= ARGV[1]
    or redis.call('HGET', KEYS[1], 'status') ~= 'INPROGRESS' then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], ARGV[3], ARGV[4], 'expires_at', ARGV[5], 'completed_at', ARGV[6])
redis.call('PEXPIREAT', KEYS[1], ARGV[5])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'claim_token') == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-based idempotency storage.
///
/// Each record is a hash with a native `PEXPIREAT` TTL, so expired records
/// disappear without a cleanup job.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
    claim_script: Script,
    finish_script: Script,
    release_script: Script,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            claim_script: Script::new(CLAIM_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    fn make_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    async fn finish(
        &self,
        key: &str,
        claim_token: Uuid,
        status: IdempotencyStatus,
        field: (&str, String),
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let updated: i64 = self
            .finish_script
            .key(self.make_key(key))
            .arg(claim_token.to_string())
            .arg(status.as_str())
            .arg(field.0)
            .arg(field.1)
            .arg(expires_at.timestamp_millis())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(updated == 1)
    }
}

/// Flattens a record into hash field/value pairs.
fn record_to_fields(record: &IdempotencyRecord) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("idempotency_key", record.idempotency_key.clone()),
        ("claim_token", record.claim_token.to_string()),
        ("status", record.status.as_str().to_string()),
        ("payload_hash", record.payload_hash.clone()),
        ("created_at", record.created_at.timestamp_millis().to_string()),
        ("expires_at", record.expires_at.timestamp_millis().to_string()),
        (
            "in_progress_expires_at",
            record.in_progress_expires_at.timestamp_millis().to_string(),
        ),
    ];
    if let Some(response) = &record.response_data {
        fields.push(("response_data", serde_json::to_string(response)?));
    }
    if let Some(message) = &record.error_message {
        fields.push(("error_message", message.clone()));
    }
    Ok(fields)
}

fn fields_to_record(key: &str, fields: &HashMap<String, String>) -> Result<IdempotencyRecord> {
    let corrupt = |field: &str| {
        AppError::Internal(anyhow::anyhow!(
            "Corrupt idempotency record for key '{}': bad or missing '{}'",
            key,
            field
        ))
    };
    let text = |field: &'static str| fields.get(field).ok_or_else(|| corrupt(field));
    let millis = |field: &'static str| -> Result<DateTime<Utc>> {
        text(field)?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(field))
    };
    let optional_millis = |field: &'static str| -> Result<Option<DateTime<Utc>>> {
        match fields.get(field) {
            Some(_) => millis(field).map(Some),
            None => Ok(None),
        }
    };

    let status = IdempotencyStatus::parse(text("status")?).ok_or_else(|| corrupt("status"))?;
    let claim_token = Uuid::parse_str(text("claim_token")?).map_err(|_| corrupt("claim_token"))?;
    let response_data = match fields.get("response_data") {
        Some(json) => Some(serde_json::from_str(json)?),
        None => None,
    };

    Ok(IdempotencyRecord {
        idempotency_key: key.to_string(),
        claim_token,
        status,
        payload_hash: text("payload_hash")?.clone(),
        response_data,
        error_message: fields.get("error_message").cloned(),
        created_at: millis("created_at")?,
        expires_at: millis("expires_at")?,
        in_progress_expires_at: millis("in_progress_expires_at")?,
        completed_at: optional_millis("completed_at")?,
    })
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.connection().await?;

        let mut invocation = self.claim_script.key(self.make_key(&record.idempotency_key));
        invocation
            .arg(now.timestamp_millis())
            .arg(record.expires_at.timestamp_millis());
        for (field, value) in record_to_fields(record)? {
            invocation.arg(field).arg(value);
        }

        let existing: HashMap<String, String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        if existing.is_empty() {
            Ok(ClaimOutcome::Claimed)
        } else {
            let record = fields_to_record(&record.idempotency_key, &existing)?;
            Ok(ClaimOutcome::AlreadyExists(Some(record)))
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(self.make_key(key))
            .await
            .map_err(AppError::Redis)?;

        if fields.is_empty() {
            return Ok(None);
        }
        fields_to_record(key, &fields).map(Some)
    }

    async fn complete_record(
        &self,
        key: &str,
        claim_token: Uuid,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let response = serde_json::to_string(response)?;
        self.finish(
            key,
            claim_token,
            IdempotencyStatus::Completed,
            ("response_data", response),
            expires_at,
        )
        .await
    }

    async fn fail_record(
        &self,
        key: &str,
        claim_token: Uuid,
        error_message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.finish(
            key,
            claim_token,
            IdempotencyStatus::Failed,
            ("error_message", error_message.to_string()),
            expires_at,
        )
        .await
    }

    async fn delete_record(&self, key: &str, claim_token: Uuid) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release_script
            .key(self.make_key(key))
            .arg(claim_token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(deleted > 0)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        // Records carry a native TTL
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }
}

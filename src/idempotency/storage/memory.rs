use super::{ClaimOutcome, IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-process store. Per-key entry locking makes every operation atomic;
/// expiry is lazy.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<DashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or replaces a record unconditionally. Test setup only.
    pub fn insert_raw(&self, record: IdempotencyRecord) {
        self.records.insert(record.idempotency_key.clone(), record);
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        match self.records.entry(record.idempotency_key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_reclaimable(now) {
                    tracing::debug!(
                        idempotency_key = %record.idempotency_key,
                        previous_status = %existing.get().status,
                        "Reclaiming stale idempotency record"
                    );
                    existing.insert(record.clone());
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::AlreadyExists(Some(existing.get().clone())))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn complete_record(
        &self,
        key: &str,
        claim_token: Uuid,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.records.get_mut(key) {
            Some(mut record)
                if record.claim_token == claim_token
                    && record.status == IdempotencyStatus::InProgress =>
            {
                record.status = IdempotencyStatus::Completed;
                record.response_data = Some(response.clone());
                record.expires_at = expires_at;
                record.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_record(
        &self,
        key: &str,
        claim_token: Uuid,
        error_message: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.records.get_mut(key) {
            Some(mut record)
                if record.claim_token == claim_token
                    && record.status == IdempotencyStatus::InProgress =>
            {
                record.status = IdempotencyStatus::Failed;
                record.error_message = Some(error_message.to_string());
                record.expires_at = expires_at;
                record.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_record(&self, key: &str, claim_token: Uuid) -> Result<bool> {
        Ok(self
            .records
            .remove_if(key, |_, record| record.claim_token == claim_token)
            .is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn claim(key: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(key, "hash", now, Duration::hours(1), Duration::seconds(30))
    }

    #[tokio::test]
    async fn test_put_if_absent_conflict_returns_existing() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let first = claim("op#1", now);

        assert_eq!(store.put_if_absent(&first, now).await.unwrap(), ClaimOutcome::Claimed);

        let second = claim("op#1", now);
        match store.put_if_absent(&second, now).await.unwrap() {
            ClaimOutcome::AlreadyExists(Some(existing)) => {
                assert_eq!(existing.claim_token, first.claim_token);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_in_progress_is_reclaimed() {
        let store = InMemoryIdempotencyStore::new();
        let then = Utc::now() - Duration::minutes(5);
        store.insert_raw(claim("op#1", then));

        let now = Utc::now();
        let fresh = claim("op#1", now);
        assert_eq!(store.put_if_absent(&fresh, now).await.unwrap(), ClaimOutcome::Claimed);

        let stored = store.get_record("op#1").await.unwrap().unwrap();
        assert_eq!(stored.claim_token, fresh.claim_token);
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let record = claim("op#1", now);
        store.put_if_absent(&record, now).await.unwrap();

        let expiry = now + Duration::hours(1);
        assert!(!store
            .complete_record("op#1", Uuid::new_v4(), &json!({"ok": true}), expiry)
            .await
            .unwrap());
        assert!(store
            .complete_record("op#1", record.claim_token, &json!({"ok": true}), expiry)
            .await
            .unwrap());

        let stored = store.get_record("op#1").await.unwrap().unwrap();
        assert_eq!(stored.status, IdempotencyStatus::Completed);
        assert_eq!(stored.response_data, Some(json!({"ok": true})));

        // Completing twice is refused
        assert!(!store
            .complete_record("op#1", record.claim_token, &json!({"ok": false}), expiry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let record = claim("op#1", now);
        store.put_if_absent(&record, now).await.unwrap();

        assert!(!store.delete_record("op#1", Uuid::new_v4()).await.unwrap());
        assert!(store.delete_record("op#1", record.claim_token).await.unwrap());
        assert!(store.get_record("op#1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_record_is_claimable() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let record = claim("op#1", now);
        store.put_if_absent(&record, now).await.unwrap();
        assert!(store
            .fail_record("op#1", record.claim_token, "boom", now + Duration::hours(1))
            .await
            .unwrap());

        let stored = store.get_record("op#1").await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("boom"));

        let retry = claim("op#1", now);
        assert_eq!(store.put_if_absent(&retry, now).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryIdempotencyStore::new();
        let old = Utc::now() - Duration::hours(3);
        store.insert_raw(claim("op#old", old));
        store.insert_raw(claim("op#new", Utc::now()));

        let purged = store.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get_record("op#new").await.unwrap().is_some());
    }
}

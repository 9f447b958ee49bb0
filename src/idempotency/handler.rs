use crate::cache::{CacheStats, RecordCache};
use crate::config::IdempotencyConfig;
use crate::error::{AppError, IdempotencyError, Result};
use crate::idempotency::key_generator::{IdempotencyKey, IdempotencyKeyGenerator};
use crate::idempotency::key_path::KeyPath;
use crate::idempotency::storage::{
    ClaimOutcome, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
};
use crate::observability::{get_metrics, mask_key, LatencyTimer};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Extra claim attempts after the store reports a state that changed under us.
pub const MAX_RETRIES: usize = 2;

/// Transforms a stored response before it is replayed to the caller.
pub type ResponseHook = Arc<dyn Fn(Value, &IdempotencyRecord) -> Value + Send + Sync>;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub in_progress_rejections: AtomicU64,
    pub new_executions: AtomicU64,
    pub completed_executions: AtomicU64,
    pub failed_executions: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_progress_rejection(&self) {
        self.in_progress_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            in_progress_rejections: self.in_progress_rejections.load(Ordering::Relaxed),
            new_executions: self.new_executions.load(Ordering::Relaxed),
            completed_executions: self.completed_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub replayed_requests: u64,
    pub in_progress_rejections: u64,
    pub new_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RunOutcome {
    Executed,
    Replayed,
}

impl RunOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Executed => "executed",
            RunOutcome::Replayed => "replayed",
        }
    }
}

enum ClaimAttempt<T> {
    Claimed(IdempotencyRecord),
    Replay(T),
}

/// Releases an unfinished claim if `run` is dropped or the work panics.
///
/// The release is best-effort; if it never lands, the in-progress expiry
/// lets the next caller reclaim the key.
struct ClaimGuard {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    claim_token: Uuid,
    armed: bool,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, key: &str, claim_token: Uuid) -> Self {
        Self {
            store,
            key: key.to_string(),
            claim_token,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let claim_token = self.claim_token;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.delete_record(&key, claim_token).await {
                        Ok(_) => tracing::debug!(
                            idempotency_key = %mask_key(&key),
                            "Released abandoned idempotency claim"
                        ),
                        Err(e) => tracing::warn!(
                            idempotency_key = %mask_key(&key),
                            "Failed to release abandoned idempotency claim: {}",
                            e
                        ),
                    }
                });
            }
            Err(_) => tracing::warn!(
                idempotency_key = %mask_key(&key),
                "No runtime to release abandoned claim; it will be reclaimed after in-progress expiry"
            ),
        }
    }
}

/// Runs caller-supplied work at most once per idempotency key.
///
/// The handler holds no per-key state of its own. Mutual exclusion comes
/// entirely from the store's atomic claim; the optional record cache only
/// short-circuits replays.
pub struct IdempotencyHandler {
    store: Arc<dyn IdempotencyStore>,
    key_generator: IdempotencyKeyGenerator,
    config: IdempotencyConfig,
    cache: Option<RecordCache>,
    metrics: Arc<IdempotencyMetrics>,
    response_hook: Option<ResponseHook>,
}

impl IdempotencyHandler {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        let cache = config
            .use_local_cache()
            .then(|| RecordCache::new(config.record_cache_settings()));

        Self {
            store,
            key_generator: IdempotencyKeyGenerator::new(config.key_generator_config()),
            config,
            cache,
            metrics: Arc::new(IdempotencyMetrics::new()),
            response_hook: None,
        }
    }

    pub fn with_response_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &IdempotencyRecord) -> Value + Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Gets the metrics for this handler.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cache_stats(&self) -> Option<Arc<CacheStats>> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn key_generator(&self) -> &IdempotencyKeyGenerator {
        &self.key_generator
    }

    /// Executes `work` once for the key derived from `scope` and `payload`.
    ///
    /// `key_path` selects the part of the payload that identifies the
    /// operation and overrides the configured event key path. A repeated
    /// call replays the stored result without invoking `work`; a call that
    /// races a live execution gets [`IdempotencyError::AlreadyInProgress`].
    pub async fn run<T, E, F, Fut>(
        &self,
        scope: &str,
        payload: &Value,
        key_path: Option<&str>,
        work: F,
    ) -> std::result::Result<T, IdempotencyError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.config.enabled() {
            tracing::debug!(scope, "Idempotency disabled, running work directly");
            return work().await.map_err(IdempotencyError::Business);
        }

        self.metrics.record_request();
        let result = self.run_idempotent(scope, payload, key_path, work).await;

        let label = match &result {
            Ok((_, outcome)) => outcome.as_str(),
            Err(e) => e.kind(),
        };
        get_metrics().record_request(scope, label);

        result.map(|(value, _)| value)
    }

    async fn run_idempotent<T, E, F, Fut>(
        &self,
        scope: &str,
        payload: &Value,
        key_path: Option<&str>,
        work: F,
    ) -> std::result::Result<(T, RunOutcome), IdempotencyError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let key_path = match key_path {
            Some(expression) => Some(
                KeyPath::parse(expression)
                    .map_err(|e| IdempotencyError::<E>::Configuration(e.to_string()))?,
            ),
            None => self.config.event_key_path().cloned(),
        };

        let key = self
            .key_generator
            .derive_key(scope, payload, key_path.as_ref())
            .map_err(|e| IdempotencyError::<E>::Configuration(e.to_string()))?;
        let payload_hash = self.key_generator.payload_hash(payload);

        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(key.as_str(), Utc::now()) {
                ensure_payload_matches::<E>(&key, &record, &payload_hash)?;
                let value = self.replay::<T, E>(&key, record)?;
                return Ok((value, RunOutcome::Replayed));
            }
        }

        let mut retries = 0;
        let claim = loop {
            match self.try_claim(&key, &payload_hash).await {
                Ok(ClaimAttempt::Claimed(record)) => break record,
                Ok(ClaimAttempt::Replay(value)) => return Ok((value, RunOutcome::Replayed)),
                Err(IdempotencyError::InconsistentState { detail, .. }) if retries < MAX_RETRIES => {
                    retries += 1;
                    get_metrics().record_claim_retry(scope);
                    tracing::debug!(
                        idempotency_key = %mask_key(key.as_str()),
                        attempt = retries,
                        "Retrying idempotency claim: {}",
                        detail
                    );
                }
                Err(e) => return Err(e),
            }
        };

        self.metrics.record_new();
        tracing::debug!(
            scope,
            idempotency_key = %mask_key(key.as_str()),
            "Idempotency key claimed, executing"
        );

        let mut guard = ClaimGuard::new(self.store(), key.as_str(), claim.claim_token);
        let timer = LatencyTimer::new();
        let result = work().await;
        get_metrics().record_execution_latency(scope, timer.elapsed_ms());
        guard.disarm();

        match result {
            Ok(value) => self
                .complete(&key, claim, value)
                .await
                .map(|value| (value, RunOutcome::Executed)),
            Err(e) => {
                self.release(&key, &claim, &e).await;
                Err(IdempotencyError::Business(e))
            }
        }
    }

    async fn try_claim<T, E>(
        &self,
        key: &IdempotencyKey,
        payload_hash: &str,
    ) -> std::result::Result<ClaimAttempt<T>, IdempotencyError<E>>
    where
        T: DeserializeOwned,
    {
        let now = Utc::now();
        let record = IdempotencyRecord::in_progress(
            key.as_str(),
            payload_hash,
            now,
            self.config.expiration(),
            self.config.in_progress_expiration(),
        );

        let timer = LatencyTimer::new();
        let outcome = self.store.put_if_absent(&record, now).await;
        self.record_store_operation("claim", &timer, outcome.is_ok());

        let existing = match outcome.map_err(|e| IdempotencyError::<E>::persistence("claim", e))? {
            ClaimOutcome::Claimed => return Ok(ClaimAttempt::Claimed(record)),
            ClaimOutcome::AlreadyExists(Some(existing)) => existing,
            ClaimOutcome::AlreadyExists(None) => {
                let timer = LatencyTimer::new();
                let fetched = self.store.get_record(key.as_str()).await;
                self.record_store_operation("get_record", &timer, fetched.is_ok());

                fetched
                    .map_err(|e| IdempotencyError::<E>::persistence("get_record", e))?
                    .ok_or_else(|| IdempotencyError::<E>::InconsistentState {
                        key: key.to_string(),
                        detail: "record vanished after claim conflict".to_string(),
                    })?
            }
        };

        self.resolve_existing(key, existing, payload_hash, Utc::now())
    }

    fn resolve_existing<T, E>(
        &self,
        key: &IdempotencyKey,
        existing: IdempotencyRecord,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ClaimAttempt<T>, IdempotencyError<E>>
    where
        T: DeserializeOwned,
    {
        if existing.is_reclaimable(now) {
            return Err(IdempotencyError::InconsistentState {
                key: key.to_string(),
                detail: format!(
                    "conflicting record is {} and should have been reclaimed",
                    existing.status_at(now)
                ),
            });
        }

        ensure_payload_matches::<E>(key, &existing, payload_hash)?;

        match existing.status {
            IdempotencyStatus::InProgress => {
                self.metrics.record_in_progress_rejection();
                tracing::info!(
                    idempotency_key = %mask_key(key.as_str()),
                    "Execution already in progress"
                );
                Err(IdempotencyError::AlreadyInProgress {
                    key: key.to_string(),
                })
            }
            IdempotencyStatus::Completed => {
                if let Some(cache) = &self.cache {
                    cache.put(&existing);
                }
                self.replay(key, existing).map(ClaimAttempt::Replay)
            }
            status => Err(IdempotencyError::InconsistentState {
                key: key.to_string(),
                detail: format!("unexpected record status {}", status),
            }),
        }
    }

    fn replay<T, E>(
        &self,
        key: &IdempotencyKey,
        record: IdempotencyRecord,
    ) -> std::result::Result<T, IdempotencyError<E>>
    where
        T: DeserializeOwned,
    {
        let response = record.response_data.clone().ok_or_else(|| {
            IdempotencyError::<E>::persistence(
                "replay",
                AppError::Internal(anyhow::anyhow!("Completed record has no response data")),
            )
        })?;

        let response = match &self.response_hook {
            Some(hook) => hook(response, &record),
            None => response,
        };

        let value = serde_json::from_value(response)
            .map_err(|e| IdempotencyError::<E>::persistence("replay", AppError::Serialization(e)))?;

        self.metrics.record_replayed();
        tracing::info!(
            idempotency_key = %mask_key(key.as_str()),
            "Replaying stored result"
        );

        Ok(value)
    }

    async fn complete<T, E>(
        &self,
        key: &IdempotencyKey,
        claim: IdempotencyRecord,
        value: T,
    ) -> std::result::Result<T, IdempotencyError<E>>
    where
        T: Serialize,
    {
        let response = match serde_json::to_value(&value) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    idempotency_key = %mask_key(key.as_str()),
                    "Failed to serialize result, releasing claim: {}",
                    e
                );
                if let Err(release_err) = self.store.delete_record(key.as_str(), claim.claim_token).await {
                    tracing::error!("Failed to release idempotency claim: {}", release_err);
                }
                return Err(IdempotencyError::persistence(
                    "serialize_response",
                    AppError::Serialization(e),
                ));
            }
        };

        let now = Utc::now();
        let expires_at = now + self.config.expiration();

        let timer = LatencyTimer::new();
        let outcome = self
            .store
            .complete_record(key.as_str(), claim.claim_token, &response, expires_at)
            .await;
        self.record_store_operation("complete", &timer, outcome.is_ok());

        match outcome {
            Ok(true) => {
                self.metrics.record_completed();
                if let Some(cache) = &self.cache {
                    cache.put(&IdempotencyRecord {
                        status: IdempotencyStatus::Completed,
                        response_data: Some(response),
                        expires_at,
                        completed_at: Some(now),
                        ..claim
                    });
                }
                tracing::info!(
                    idempotency_key = %mask_key(key.as_str()),
                    "Idempotent execution completed"
                );
                Ok(value)
            }
            Ok(false) => {
                tracing::warn!(
                    idempotency_key = %mask_key(key.as_str()),
                    "Claim was taken over before completion; result not recorded"
                );
                Err(IdempotencyError::NotRecorded {
                    key: key.to_string(),
                    response,
                    reason: "claim no longer owned at completion".to_string(),
                })
            }
            Err(e) => {
                tracing::error!(
                    idempotency_key = %mask_key(key.as_str()),
                    "Failed to record completed result: {}",
                    e
                );
                Err(IdempotencyError::NotRecorded {
                    key: key.to_string(),
                    response,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Frees the key after a business failure. Errors are logged, never returned.
    async fn release<E: fmt::Display>(
        &self,
        key: &IdempotencyKey,
        claim: &IdempotencyRecord,
        error: &E,
    ) {
        self.metrics.record_failed();
        if let Some(cache) = &self.cache {
            cache.invalidate(key.as_str());
        }

        let timer = LatencyTimer::new();
        let (operation, result) = if self.config.persist_failures() {
            let expires_at = Utc::now() + self.config.expiration();
            let message = error.to_string();
            (
                "fail_record",
                self.store
                    .fail_record(key.as_str(), claim.claim_token, &message, expires_at)
                    .await,
            )
        } else {
            (
                "delete_record",
                self.store.delete_record(key.as_str(), claim.claim_token).await,
            )
        };
        self.record_store_operation(operation, &timer, result.is_ok());

        match result {
            Ok(true) => tracing::debug!(
                idempotency_key = %mask_key(key.as_str()),
                operation,
                "Released idempotency claim after failure"
            ),
            Ok(false) => tracing::warn!(
                idempotency_key = %mask_key(key.as_str()),
                operation,
                "Claim was already taken over when releasing after failure"
            ),
            Err(e) => tracing::error!(
                idempotency_key = %mask_key(key.as_str()),
                operation,
                "Failed to release idempotency claim: {}",
                e
            ),
        }
    }

    /// Runs cleanup of expired idempotency records.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let count = self.store.purge_expired(Utc::now()).await?;
        get_metrics().record_records_purged(self.store.backend_name(), count);
        Ok(count)
    }

    fn record_store_operation(&self, operation: &str, timer: &LatencyTimer, success: bool) {
        get_metrics().record_store_operation(
            self.store.backend_name(),
            operation,
            timer.elapsed_ms(),
            success,
        );
    }
}

fn ensure_payload_matches<E>(
    key: &IdempotencyKey,
    record: &IdempotencyRecord,
    payload_hash: &str,
) -> std::result::Result<(), IdempotencyError<E>> {
    if record.payload_hash != payload_hash {
        tracing::warn!(
            idempotency_key = %mask_key(key.as_str()),
            "Payload does not match stored record"
        );
        return Err(IdempotencyError::Validation {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    handler: Arc<IdempotencyHandler>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(handler: Arc<IdempotencyHandler>, interval_seconds: u64) -> Self {
        Self {
            handler,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.handler.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds.max(1)));

            loop {
                interval.tick().await;

                match self.handler.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}

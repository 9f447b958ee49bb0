use crate::idempotency::storage::IdempotencyStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    /// A degraded store still accepts claims; only an unhealthy one does not.
    pub fn accepts_traffic(&self) -> bool {
        !self.status.is_unhealthy()
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health checker for the idempotency store.
pub struct HealthChecker {
    store: Arc<dyn IdempotencyStore>,
    timeout: Duration,
    degraded_latency_ms: f64,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(5),
            degraded_latency_ms: 100.0,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let dependencies = vec![self.check_store().await];

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }

    /// Checks persistence store connectivity.
    pub async fn check_store(&self) -> DependencyHealth {
        let name = self.store.backend_name();
        let start = std::time::Instant::now();

        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(Ok(())) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                if latency > self.degraded_latency_ms {
                    DependencyHealth {
                        name: name.to_string(),
                        status: HealthStatus::Degraded,
                        latency_ms: Some(latency),
                        message: Some("High latency detected".to_string()),
                    }
                } else {
                    DependencyHealth::healthy(name, latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::unhealthy(name, format!("Ping failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(name, "Ping timeout"),
        }
    }

    /// Readiness check - returns true if the store can accept claims.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::idempotency::storage::{InMemoryIdempotencyStore, MockIdempotencyStore};

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Healthy.is_degraded());
        assert!(!HealthStatus::Healthy.is_unhealthy());

        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Degraded.is_degraded());
        assert!(!HealthStatus::Degraded.is_unhealthy());

        assert!(!HealthStatus::Unhealthy.is_healthy());
        assert!(!HealthStatus::Unhealthy.is_degraded());
        assert!(HealthStatus::Unhealthy.is_unhealthy());
    }

    #[test]
    fn test_aggregated_health_status() {
        let one_degraded = vec![
            DependencyHealth::healthy("postgres", 1.0),
            DependencyHealth::degraded("redis", "slow"),
        ];
        let health = AggregatedHealth::new("1.0.0".to_string(), 100, one_degraded);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.accepts_traffic());

        let one_unhealthy = vec![
            DependencyHealth::healthy("postgres", 1.0),
            DependencyHealth::unhealthy("redis", "down"),
        ];
        let health = AggregatedHealth::new("1.0.0".to_string(), 100, one_unhealthy);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.accepts_traffic());
    }

    #[tokio::test]
    async fn test_memory_store_is_healthy() {
        let checker = HealthChecker::new(Arc::new(InMemoryIdempotencyStore::new()));
        let health = checker.check_all().await;

        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.dependencies[0].name, "memory");
        assert!(checker.is_ready().await);
    }

    #[test]
    fn test_slow_store_still_accepts_traffic() {
        let slow = vec![DependencyHealth {
            name: "postgres".to_string(),
            status: HealthStatus::Degraded,
            latency_ms: Some(150.0),
            message: Some("High latency detected".to_string()),
        }];
        let health = AggregatedHealth::new("1.0.0".to_string(), 0, slow);

        assert!(!health.status.is_healthy());
        assert!(health.accepts_traffic());
    }

    #[tokio::test]
    async fn test_failing_store_is_unhealthy() {
        let mut store = MockIdempotencyStore::new();
        store.expect_backend_name().return_const("postgres");
        store
            .expect_ping()
            .returning(|| Err(AppError::Configuration("connection refused".to_string())));

        let checker = HealthChecker::new(Arc::new(store));
        let health = checker.check_store().await;

        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.message.unwrap().contains("connection refused"));
        assert!(!checker.is_ready().await);
    }
}

mod common;

use idempotency_engine::observability::{
    init_logging, mask_key, mask_sensitive, AggregatedHealth, DependencyHealth, HealthChecker,
    HealthStatus, LatencyTimer, LogConfig, LogFormat, Metrics,
};
use serde_json::{json, Value};

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, LogFormat::Pretty);
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    let config = LogConfig {
        format: LogFormat::Json,
        ..LogConfig::default()
    };
    init_logging(&config);
    init_logging(&LogConfig::default());
}

#[test]
fn test_mask_sensitive_exact_boundary() {
    assert_eq!(mask_sensitive("1234", 2), "****");
}

#[test]
fn test_mask_sensitive_multibyte() {
    assert_eq!(mask_sensitive("héllo wörld", 2), "hé*******ld");
}

#[test]
fn test_mask_key_hides_digest() {
    let masked = mask_key("orders-svc:createOrder#9f86d081884c7d659a2feaa0c55ad015");
    assert!(masked.starts_with("orders-svc:createOrder#9f86"));
    assert!(masked.ends_with("d015"));
    assert!(!masked.contains("884c7d659a2feaa0c55a"));
}

#[test]
fn test_metrics_recording() {
    let metrics = Metrics::new();
    metrics.record_request("createOrder", "executed");
    metrics.record_request("createOrder", "replayed");
    metrics.record_execution_latency("createOrder", 12.5);
    metrics.record_store_operation("postgres", "claim", 1.5, true);
    metrics.record_store_operation("redis", "complete", 0.8, false);
    metrics.record_claim_retry("createOrder");
    metrics.record_cache_lookup(false);
    metrics.record_records_purged("postgres", 3);
}

#[test]
fn test_latency_timer() {
    let timer = LatencyTimer::new();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let elapsed = timer.elapsed_ms();
    assert!(elapsed >= 10.0);
    assert!(elapsed < 1000.0);
}

#[test]
fn test_dependency_health_constructors() {
    let health = DependencyHealth::healthy("postgres", 5.0);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.latency_ms, Some(5.0));
    assert!(health.message.is_none());

    let health = DependencyHealth::degraded("redis", "High latency");
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.latency_ms.is_none());
    assert_eq!(health.message, Some("High latency".to_string()));
}

#[test]
fn test_aggregated_health_empty_dependencies() {
    let health = AggregatedHealth::new("1.0.0".to_string(), 0, vec![]);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.dependencies.is_empty());
}

#[test]
fn test_aggregated_health_serialization() {
    let health = AggregatedHealth::new(
        "1.0.0".to_string(),
        100,
        vec![DependencyHealth::healthy("memory", 0.1)],
    );
    let json = serde_json::to_string(&health).unwrap();

    assert!(json.contains("\"status\":\"healthy\""));
    assert!(json.contains("\"version\":\"1.0.0\""));
    assert!(json.contains("\"uptime_seconds\":100"));
    assert!(json.contains("\"name\":\"memory\""));
}

#[tokio::test]
async fn test_health_checker_uses_handler_store() {
    let (_store, handler) = common::default_memory_handler();

    let _: Value = handler
        .run("createOrder", &json!({"orderId": "42"}), None, || async {
            Ok::<_, String>(json!({"status": "ok"}))
        })
        .await
        .unwrap();

    let checker = HealthChecker::new(handler.store());
    let health = checker.check_all().await;

    assert!(health.status.is_healthy());
    assert_eq!(health.dependencies.len(), 1);
    assert_eq!(health.dependencies[0].name, "memory");
    assert!(checker.is_ready().await);
}

#[test]
fn test_health_check_from_sync_context() {
    let (_store, handler) = common::default_memory_handler();
    let checker = HealthChecker::new(handler.store()).with_timeout(std::time::Duration::from_secs(1));

    let dependency = tokio_test::block_on(checker.check_store());
    assert_eq!(dependency.status, HealthStatus::Healthy);
    assert!(dependency.latency_ms.is_some());
    assert!(checker.uptime_seconds() < 60);
}

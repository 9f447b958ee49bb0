use metrics::{counter, histogram, describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency engine.
///
/// Without an installed recorder every call is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// One finished `run` call, labelled by how it ended.
    pub fn record_request(&self, scope: &str, outcome: &str) {
        counter!("idempotency_requests_total", "scope" => scope.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_execution_latency(&self, scope: &str, duration_ms: f64) {
        histogram!("idempotency_execution_duration_ms", "scope" => scope.to_string()).record(duration_ms);
    }

    pub fn record_store_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_operation_duration_ms", "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_claim_retry(&self, scope: &str) {
        counter!("idempotency_claim_retries_total", "scope" => scope.to_string()).increment(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            counter!("idempotency_cache_hits_total").increment(1);
        } else {
            counter!("idempotency_cache_misses_total").increment(1);
        }
    }

    pub fn record_records_purged(&self, backend: &str, count: u64) {
        counter!("idempotency_records_purged_total", "backend" => backend.to_string()).increment(count);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Idempotent run calls by outcome");
    describe_histogram!("idempotency_execution_duration_ms", Unit::Milliseconds, "Wrapped function execution latency in milliseconds");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Persistence store operations");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "Persistence store operation latency in milliseconds");

    describe_counter!("idempotency_claim_retries_total", Unit::Count, "Claim attempts retried after inconsistent store state");
    describe_counter!("idempotency_cache_hits_total", Unit::Count, "Local record cache hits");
    describe_counter!("idempotency_cache_misses_total", Unit::Count, "Local record cache misses");
    describe_counter!("idempotency_records_purged_total", Unit::Count, "Expired records removed by the cleanup job");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

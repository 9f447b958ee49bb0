use anyhow::Context;
use idempotency_engine::config::{BackendKind, Settings};
use idempotency_engine::idempotency::{
    IdempotencyCleanupJob, IdempotencyHandler, IdempotencyStore, InMemoryIdempotencyStore,
    PostgresIdempotencyStore, RedisIdempotencyStore,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::new().context("failed to load configuration")?;
    init_logging(&settings.logging);
    info!("Configuration loaded");

    if let Err(e) = init_metrics() {
        warn!("Prometheus recorder not installed: {}", e);
    }

    let store = build_store(&settings).await?;
    let config = settings
        .idempotency
        .to_config()
        .context("invalid idempotency configuration")?;

    if !config.enabled() {
        warn!("Idempotency is disabled; work will run without deduplication");
    }

    let health = HealthChecker::new(Arc::clone(&store)).check_all().await;
    if !health.accepts_traffic() {
        anyhow::bail!("store health check failed: {:?}", health.dependencies);
    }
    if health.status.is_degraded() {
        warn!(
            backend = store.backend_name(),
            dependencies = ?health.dependencies,
            "Idempotency store reachable but degraded"
        );
    } else {
        info!(backend = store.backend_name(), "Idempotency store healthy");
    }

    let handler = Arc::new(IdempotencyHandler::new(store, config));

    let cleanup = if settings.cleanup.enabled {
        Some(IdempotencyCleanupJob::new(Arc::clone(&handler), settings.cleanup.interval_secs).start())
    } else {
        None
    };

    info!("Idempotency engine ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(job) = cleanup {
        job.abort();
    }

    Ok(())
}

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn IdempotencyStore>> {
    match settings.backend.kind {
        BackendKind::Memory => {
            info!("Using in-memory idempotency store");
            Ok(Arc::new(InMemoryIdempotencyStore::new()))
        }
        BackendKind::Postgres => {
            let database = settings
                .database
                .as_ref()
                .context("postgres backend selected but [database] is missing")?;

            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(database.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&database.url)
                .await?;

            let store = PostgresIdempotencyStore::new(pool);
            info!("Running database migrations...");
            store.migrate().await?;
            info!("Migrations applied successfully");

            Ok(Arc::new(store))
        }
        BackendKind::Redis => {
            let redis = settings
                .redis
                .as_ref()
                .context("redis backend selected but [redis] is missing")?;

            info!("Connecting to Redis...");
            let client = redis::Client::open(redis.url.as_str())?;
            let store = RedisIdempotencyStore::new(client, redis.key_prefix.clone());
            store.ping().await?;
            info!("Redis connection established");

            Ok(Arc::new(store))
        }
    }
}

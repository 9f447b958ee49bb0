pub mod handler;
pub mod key_generator;
pub mod key_path;
pub mod storage;

pub use handler::{
    IdempotencyCleanupJob, IdempotencyHandler, IdempotencyMetrics, MetricsSnapshot, ResponseHook,
    MAX_RETRIES,
};
pub use key_generator::{
    canonical_json, HashAlgorithm, IdempotencyKey, IdempotencyKeyGenerator, KeyGeneratorConfig,
};
pub use key_path::KeyPath;
pub use storage::{
    ClaimOutcome, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore, RedisIdempotencyStore,
};

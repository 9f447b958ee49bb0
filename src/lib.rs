pub mod cache;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod observability;

pub use config::IdempotencyConfig;
pub use error::{AppError, IdempotencyError};
pub use idempotency::{IdempotencyHandler, IdempotencyStore};

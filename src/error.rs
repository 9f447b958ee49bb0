use thiserror::Error;

/// Infrastructure-level errors raised by stores, configuration and key derivation.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Idempotency key error: {0}")]
    Key(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure returned by [`IdempotencyHandler::run`](crate::idempotency::IdempotencyHandler::run).
///
/// `E` is the business error produced by the wrapped function; it is passed
/// through untouched in [`IdempotencyError::Business`].
#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    /// Bad key path or no data to key on. Never retried.
    #[error("Idempotency configuration error: {0}")]
    Configuration(String),

    /// The stored record for this key was created from a different payload.
    #[error("Payload does not match stored record for idempotency key {key}")]
    Validation { key: String },

    /// Another caller holds a live claim on this key.
    #[error("Execution already in progress with idempotency key {key}")]
    AlreadyInProgress { key: String },

    #[error("Idempotency persistence failure ({operation}): {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: AppError,
    },

    /// The wrapped function succeeded but its result could not be recorded.
    /// The serialized result is carried so the caller can still use it.
    #[error("Result for idempotency key {key} was produced but not recorded: {reason}")]
    NotRecorded {
        key: String,
        response: serde_json::Value,
        reason: String,
    },

    /// Claim and read kept disagreeing after all internal retries.
    #[error("Idempotency store returned inconsistent state for key {key}: {detail}")]
    InconsistentState { key: String, detail: String },

    /// Error returned by the wrapped function.
    #[error("{0}")]
    Business(E),
}

impl<E> IdempotencyError<E> {
    pub(crate) fn persistence(operation: &'static str, source: AppError) -> Self {
        IdempotencyError::Persistence { operation, source }
    }

    /// Returns true for contention, which callers usually retry later.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, IdempotencyError::AlreadyInProgress { .. })
    }

    /// Returns the business error if this failure came from the wrapped function.
    pub fn into_business(self) -> Option<E> {
        match self {
            IdempotencyError::Business(e) => Some(e),
            _ => None,
        }
    }

    /// Returns a short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IdempotencyError::Configuration(_) => "configuration",
            IdempotencyError::Validation { .. } => "validation",
            IdempotencyError::AlreadyInProgress { .. } => "in_progress",
            IdempotencyError::Persistence { .. } => "persistence",
            IdempotencyError::NotRecorded { .. } => "not_recorded",
            IdempotencyError::InconsistentState { .. } => "inconsistent_state",
            IdempotencyError::Business(_) => "business",
        }
    }
}

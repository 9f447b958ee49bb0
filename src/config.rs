use crate::cache::RecordCacheSettings;
use crate::error::{AppError, Result};
use crate::idempotency::key_generator::{HashAlgorithm, KeyGeneratorConfig};
use crate::idempotency::key_path::KeyPath;
use crate::observability::LogConfig;
use serde::Deserialize;
use std::time::Duration;

/// Setting this variable to `true` turns idempotency off process-wide.
pub const IDEMPOTENCY_DISABLED_ENV: &str = "IDEMPOTENCY_DISABLED";

/// Validated idempotency policy. Read-only once built.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    enabled: bool,
    expiration: chrono::Duration,
    in_progress_expiration: chrono::Duration,
    event_key_path: Option<KeyPath>,
    payload_validation_path: Option<KeyPath>,
    key_prefix: Option<String>,
    hash_algorithm: HashAlgorithm,
    persist_failures: bool,
    use_local_cache: bool,
    local_cache_max_items: u64,
    local_cache_ttl: Duration,
}

impl IdempotencyConfig {
    pub fn builder() -> IdempotencyConfigBuilder {
        IdempotencyConfigBuilder::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// How long a COMPLETED record is honored.
    pub fn expiration(&self) -> chrono::Duration {
        self.expiration
    }

    /// How long an IN_PROGRESS claim is honored before it may be reclaimed.
    pub fn in_progress_expiration(&self) -> chrono::Duration {
        self.in_progress_expiration
    }

    pub fn event_key_path(&self) -> Option<&KeyPath> {
        self.event_key_path.as_ref()
    }

    pub fn persist_failures(&self) -> bool {
        self.persist_failures
    }

    pub fn use_local_cache(&self) -> bool {
        self.use_local_cache
    }

    pub fn key_generator_config(&self) -> KeyGeneratorConfig {
        KeyGeneratorConfig {
            key_prefix: self.key_prefix.clone(),
            hash_algorithm: self.hash_algorithm,
            payload_validation_path: self.payload_validation_path.clone(),
        }
    }

    pub fn record_cache_settings(&self) -> RecordCacheSettings {
        RecordCacheSettings {
            max_items: self.local_cache_max_items,
            ttl: self.local_cache_ttl,
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration: chrono::Duration::hours(1),
            in_progress_expiration: chrono::Duration::seconds(30),
            event_key_path: None,
            payload_validation_path: None,
            key_prefix: None,
            hash_algorithm: HashAlgorithm::Sha256,
            persist_failures: false,
            use_local_cache: false,
            local_cache_max_items: 256,
            local_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Builder for [`IdempotencyConfig`]; all checks run in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct IdempotencyConfigBuilder {
    enabled: bool,
    expiration: Duration,
    in_progress_expiration: Duration,
    event_key_path: Option<String>,
    payload_validation_path: Option<String>,
    key_prefix: Option<String>,
    hash_algorithm: HashAlgorithm,
    persist_failures: bool,
    use_local_cache: bool,
    local_cache_max_items: u64,
    local_cache_ttl: Duration,
}

impl Default for IdempotencyConfigBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration: Duration::from_secs(60 * 60),
            in_progress_expiration: Duration::from_secs(30),
            event_key_path: None,
            payload_validation_path: None,
            key_prefix: None,
            hash_algorithm: HashAlgorithm::Sha256,
            persist_failures: false,
            use_local_cache: false,
            local_cache_max_items: 256,
            local_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl IdempotencyConfigBuilder {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_in_progress_expiration(mut self, expiration: Duration) -> Self {
        self.in_progress_expiration = expiration;
        self
    }

    pub fn with_event_key_path(mut self, path: impl Into<String>) -> Self {
        self.event_key_path = Some(path.into());
        self
    }

    pub fn with_payload_validation_path(mut self, path: impl Into<String>) -> Self {
        self.payload_validation_path = Some(path.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    pub fn with_persist_failures(mut self, persist: bool) -> Self {
        self.persist_failures = persist;
        self
    }

    pub fn with_local_cache(mut self, max_items: u64, ttl: Duration) -> Self {
        self.use_local_cache = true;
        self.local_cache_max_items = max_items;
        self.local_cache_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<IdempotencyConfig> {
        if self.expiration.is_zero() {
            return Err(AppError::Configuration(
                "Record expiration must be greater than zero".to_string(),
            ));
        }
        if self.in_progress_expiration.is_zero() {
            return Err(AppError::Configuration(
                "In-progress expiration must be greater than zero".to_string(),
            ));
        }
        if self.in_progress_expiration >= self.expiration {
            return Err(AppError::Configuration(format!(
                "In-progress expiration ({:?}) must be shorter than record expiration ({:?})",
                self.in_progress_expiration, self.expiration
            )));
        }
        if self.use_local_cache && self.local_cache_max_items == 0 {
            return Err(AppError::Configuration(
                "Local cache size must be greater than zero".to_string(),
            ));
        }
        if let Some(prefix) = &self.key_prefix {
            if prefix.trim().is_empty() || prefix.contains('#') {
                return Err(AppError::Configuration(format!(
                    "Invalid key prefix '{}'",
                    prefix
                )));
            }
        }

        let to_chrono = |d: Duration| {
            chrono::Duration::from_std(d)
                .map_err(|e| AppError::Configuration(format!("Duration out of range: {}", e)))
        };

        Ok(IdempotencyConfig {
            enabled: self.enabled,
            expiration: to_chrono(self.expiration)?,
            in_progress_expiration: to_chrono(self.in_progress_expiration)?,
            event_key_path: self.event_key_path.as_deref().map(KeyPath::parse).transpose()?,
            payload_validation_path: self
                .payload_validation_path
                .as_deref()
                .map(KeyPath::parse)
                .transpose()?,
            key_prefix: self.key_prefix,
            hash_algorithm: self.hash_algorithm,
            persist_failures: self.persist_failures,
            use_local_cache: self.use_local_cache,
            local_cache_max_items: self.local_cache_max_items,
            local_cache_ttl: self.local_cache_ttl,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub backend: BackendSettings,
    pub database: Option<DatabaseSettings>,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub cleanup: CleanupSettings,
}

/// Raw idempotency section, durations in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub enabled: bool,
    pub expiration_secs: u64,
    pub in_progress_expiration_secs: u64,
    pub event_key_path: Option<String>,
    pub payload_validation_path: Option<String>,
    pub key_prefix: Option<String>,
    pub hash_algorithm: String,
    pub persist_failures: bool,
    pub use_local_cache: bool,
    pub local_cache_max_items: u64,
    pub local_cache_ttl_secs: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration_secs: 3600,
            in_progress_expiration_secs: 30,
            event_key_path: None,
            payload_validation_path: None,
            key_prefix: None,
            hash_algorithm: "sha256".to_string(),
            persist_failures: false,
            use_local_cache: false,
            local_cache_max_items: 256,
            local_cache_ttl_secs: 60,
        }
    }
}

impl IdempotencySettings {
    pub fn to_config(&self) -> Result<IdempotencyConfig> {
        let mut builder = IdempotencyConfig::builder()
            .with_enabled(self.enabled)
            .with_expiration(Duration::from_secs(self.expiration_secs))
            .with_in_progress_expiration(Duration::from_secs(self.in_progress_expiration_secs))
            .with_hash_algorithm(self.hash_algorithm.parse::<HashAlgorithm>()?)
            .with_persist_failures(self.persist_failures);

        if let Some(path) = &self.event_key_path {
            builder = builder.with_event_key_path(path);
        }
        if let Some(path) = &self.payload_validation_path {
            builder = builder.with_payload_validation_path(path);
        }
        if let Some(prefix) = &self.key_prefix {
            builder = builder.with_key_prefix(prefix);
        }
        if self.use_local_cache {
            builder = builder.with_local_cache(
                self.local_cache_max_items,
                Duration::from_secs(self.local_cache_ttl_secs),
            );
        }

        builder.build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
    Redis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

fn default_redis_prefix() -> String {
    "idempotency".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if std::env::var(IDEMPOTENCY_DISABLED_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            settings.idempotency.enabled = false;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IdempotencyConfig::builder().build().unwrap();
        assert!(config.enabled());
        assert_eq!(config.expiration(), chrono::Duration::hours(1));
        assert_eq!(config.in_progress_expiration(), chrono::Duration::seconds(30));
        assert!(!config.persist_failures());
        assert!(!config.use_local_cache());
        assert!(config.event_key_path().is_none());
    }

    #[test]
    fn test_in_progress_must_be_shorter_than_expiration() {
        let result = IdempotencyConfig::builder()
            .with_expiration(Duration::from_secs(10))
            .with_in_progress_expiration(Duration::from_secs(10))
            .build();
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_zero_durations_rejected() {
        assert!(IdempotencyConfig::builder()
            .with_expiration(Duration::ZERO)
            .build()
            .is_err());
        assert!(IdempotencyConfig::builder()
            .with_in_progress_expiration(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_bad_key_path_rejected_at_build() {
        let result = IdempotencyConfig::builder()
            .with_event_key_path("body..id")
            .build();
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_cache_size_validated() {
        let result = IdempotencyConfig::builder()
            .with_local_cache(0, Duration::from_secs(5))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [idempotency]
                expiration_secs = 600
                in_progress_expiration_secs = 20
                event_key_path = "body.orderId"
                use_local_cache = true

                [backend]
                kind = "redis"

                [redis]
                url = "redis://localhost:6379"

                [logging]
                level = "debug"
                format = "json"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.backend.kind, BackendKind::Redis);
        assert_eq!(settings.redis.as_ref().unwrap().key_prefix, "idempotency");
        assert!(settings.database.is_none());
        assert_eq!(settings.logging.format, crate::observability::LogFormat::Json);

        let config = settings.idempotency.to_config().unwrap();
        assert_eq!(config.expiration(), chrono::Duration::minutes(10));
        assert_eq!(config.event_key_path().map(|p| p.as_str()), Some("body.orderId"));
        assert!(config.use_local_cache());
        assert_eq!(config.record_cache_settings().max_items, 256);
    }

    #[test]
    fn test_unknown_hash_algorithm_rejected() {
        let settings = IdempotencySettings {
            hash_algorithm: "sha-521".to_string(),
            ..IdempotencySettings::default()
        };
        assert!(matches!(
            settings.to_config(),
            Err(AppError::Configuration(_))
        ));

        let settings = IdempotencySettings {
            hash_algorithm: "SHA-512".to_string(),
            ..IdempotencySettings::default()
        };
        assert!(settings.to_config().is_ok());
    }
}

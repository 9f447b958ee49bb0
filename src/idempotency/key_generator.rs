use crate::error::{AppError, Result};
use crate::idempotency::key_path::KeyPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Digest used for idempotency keys and payload hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Hashes raw bytes and returns a lower-case hex digest.
    pub fn digest(&self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(AppError::Configuration(format!(
                "Unsupported hash algorithm '{}'",
                s
            ))),
        }
    }
}

/// Configuration for idempotency key generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyGeneratorConfig {
    /// Optional global namespace placed in front of every scope
    pub key_prefix: Option<String>,
    pub hash_algorithm: HashAlgorithm,
    /// Part of the payload hashed into `payload_hash`; whole payload when unset
    pub payload_validation_path: Option<KeyPath>,
}

/// Derived idempotency key, `"{scope}#{digest}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pure key and payload-hash derivation. No I/O.
#[derive(Debug, Clone, Default)]
pub struct IdempotencyKeyGenerator {
    config: KeyGeneratorConfig,
}

impl IdempotencyKeyGenerator {
    pub fn new(config: KeyGeneratorConfig) -> Self {
        Self { config }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyGeneratorConfig::default())
    }

    /// Derives the key for `payload` under `scope`.
    ///
    /// With a `key_path` only the selected sub-value is hashed, otherwise the
    /// canonical encoding of the whole payload is.
    pub fn derive_key(
        &self,
        scope: &str,
        payload: &Value,
        key_path: Option<&KeyPath>,
    ) -> Result<IdempotencyKey> {
        if scope.trim().is_empty() {
            return Err(AppError::Key("Idempotency scope cannot be empty".to_string()));
        }

        let selected = match key_path {
            Some(path) => path.select(payload).ok_or_else(|| {
                AppError::Key(format!(
                    "No data found to create a hashed idempotency key (path: {})",
                    path
                ))
            })?,
            None => {
                if is_empty_payload(payload) {
                    return Err(AppError::Key(
                        "No data found to create a hashed idempotency key".to_string(),
                    ));
                }
                payload.clone()
            }
        };

        let hash = self.hash_value(&selected);
        let key = match &self.config.key_prefix {
            Some(prefix) => format!("{}:{}#{}", prefix, scope, hash),
            None => format!("{}#{}", scope, hash),
        };

        Ok(IdempotencyKey(key))
    }

    /// Hash stored with a record and compared on every later request for the same key.
    pub fn payload_hash(&self, payload: &Value) -> String {
        match &self.config.payload_validation_path {
            Some(path) => {
                let selected = path.select(payload).unwrap_or(Value::Null);
                self.hash_value(&selected)
            }
            None => self.hash_value(payload),
        }
    }

    /// Hashes the canonical encoding of a JSON value.
    pub fn hash_value(&self, value: &Value) -> String {
        self.config.hash_algorithm.digest(canonical_json(value).as_bytes())
    }
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_generation_consistency() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let payload = json!({"orderId": "42", "amount": 100});

        let key1 = generator.derive_key("createOrder", &payload, None).unwrap();
        let key2 = generator.derive_key("createOrder", &payload, None).unwrap();

        assert_eq!(key1, key2);
        assert!(key1.as_str().starts_with("createOrder#"));
    }

    #[test]
    fn test_key_ignores_field_order_and_whitespace() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": true}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":true,"y":[1,2]},"b":1}"#).unwrap();

        assert_eq!(
            generator.derive_key("op", &a, None).unwrap(),
            generator.derive_key("op", &b, None).unwrap()
        );
    }

    #[test]
    fn test_different_payloads_different_keys() {
        let generator = IdempotencyKeyGenerator::with_default_config();

        let key1 = generator.derive_key("payment", &json!({"amount": "100.00"}), None).unwrap();
        let key2 = generator.derive_key("payment", &json!({"amount": "200.00"}), None).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_scope_namespaces_key() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let payload = json!({"id": 1});

        let key1 = generator.derive_key("createOrder", &payload, None).unwrap();
        let key2 = generator.derive_key("cancelOrder", &payload, None).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_explicit_path_only_uses_selected_value() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let path = KeyPath::parse("body.orderId").unwrap();

        let key1 = generator
            .derive_key("op", &json!({"body": {"orderId": "42", "ts": 1}}), Some(&path))
            .unwrap();
        let key2 = generator
            .derive_key("op", &json!({"body": {"orderId": "42", "ts": 2}}), Some(&path))
            .unwrap();

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_string_and_number_hash_differently() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let path = KeyPath::parse("id").unwrap();

        let key1 = generator.derive_key("op", &json!({"id": "42"}), Some(&path)).unwrap();
        let key2 = generator.derive_key("op", &json!({"id": 42}), Some(&path)).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_unresolved_path_is_key_error() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        let path = KeyPath::parse("body.missing").unwrap();

        let result = generator.derive_key("op", &json!({"body": {}}), Some(&path));
        assert!(matches!(result, Err(AppError::Key(_))));
    }

    #[test]
    fn test_empty_payload_and_scope_rejected() {
        let generator = IdempotencyKeyGenerator::with_default_config();
        assert!(generator.derive_key("op", &Value::Null, None).is_err());
        assert!(generator.derive_key("op", &json!({}), None).is_err());
        assert!(generator.derive_key(" ", &json!({"a": 1}), None).is_err());
    }

    #[test]
    fn test_prefix_and_algorithm() {
        let generator = IdempotencyKeyGenerator::new(KeyGeneratorConfig {
            key_prefix: Some("orders-svc".to_string()),
            hash_algorithm: HashAlgorithm::Sha512,
            payload_validation_path: None,
        });

        let key = generator.derive_key("op", &json!({"a": 1}), None).unwrap();
        assert!(key.as_str().starts_with("orders-svc:op#"));
        // 128 hex chars for SHA-512
        assert_eq!(key.as_str().len(), "orders-svc:op#".len() + 128);
    }

    #[test]
    fn test_payload_hash_with_validation_path() {
        let generator = IdempotencyKeyGenerator::new(KeyGeneratorConfig {
            payload_validation_path: Some(KeyPath::parse("amount").unwrap()),
            ..KeyGeneratorConfig::default()
        });

        let h1 = generator.payload_hash(&json!({"amount": 10, "note": "a"}));
        let h2 = generator.payload_hash(&json!({"amount": 10, "note": "b"}));
        let h3 = generator.payload_hash(&json!({"amount": 11, "note": "a"}));

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_canonical_json() {
        let value = json!({"b": [3, {"d": 1, "c": "x"}], "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"b":[3,{"c":"x","d":1}]}"#);
    }

    #[test]
    fn test_hash_algorithm_from_str() {
        assert_eq!("SHA-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!(matches!(
            "md5".parse::<HashAlgorithm>(),
            Err(AppError::Configuration(_))
        ));
    }
}

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    /// `body.order.id`, `Records[0].messageId`
    Dotted(Vec<Segment>),
    /// `/body/order/id`
    Pointer(String),
    /// `[user, order.id]`
    Multi(Vec<Vec<Segment>>),
}

/// Compiled expression selecting the part of a payload used for an
/// idempotency key or for payload validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath {
    source: String,
    selector: Selector,
}

impl KeyPath {
    /// Parses a path expression. Syntax errors are configuration errors.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(AppError::Configuration(
                "Idempotency key path cannot be empty".to_string(),
            ));
        }

        let selector = if trimmed.starts_with('/') {
            Selector::Pointer(trimmed.to_string())
        } else if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .filter(|inner| !inner.trim().is_empty() && !is_index(inner))
        {
            let paths = inner
                .split(',')
                .map(|part| parse_dotted(part.trim(), expression))
                .collect::<Result<Vec<_>>>()?;
            Selector::Multi(paths)
        } else {
            Selector::Dotted(parse_dotted(trimmed, expression)?)
        };

        Ok(Self {
            source: trimmed.to_string(),
            selector,
        })
    }

    /// Returns the expression this path was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Selects the referenced value. Returns `None` when nothing usable was
    /// found: a missing field, `null`, or a container holding only `null`s.
    pub fn select(&self, payload: &Value) -> Option<Value> {
        let selected = match &self.selector {
            Selector::Pointer(pointer) => payload.pointer(pointer).cloned(),
            Selector::Dotted(segments) => walk(payload, segments).cloned(),
            Selector::Multi(paths) => Some(Value::Array(
                paths
                    .iter()
                    .map(|segments| walk(payload, segments).cloned().unwrap_or(Value::Null))
                    .collect(),
            )),
        };

        selected.filter(|value| !is_missing(value))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for KeyPath {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        KeyPath::parse(&value)
    }
}

impl From<KeyPath> for String {
    fn from(path: KeyPath) -> Self {
        path.source
    }
}

fn is_index(inner: &str) -> bool {
    inner.trim().chars().all(|c| c.is_ascii_digit())
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().all(Value::is_null),
        Value::Object(map) => map.values().all(Value::is_null),
        _ => false,
    }
}

fn walk<'a>(payload: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(payload, |current, segment| match segment {
            Segment::Field(name) => current.get(name.as_str()),
            Segment::Index(index) => current.get(*index),
        })
}

fn parse_dotted(path: &str, expression: &str) -> Result<Vec<Segment>> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let invalid = |reason: &str| {
        AppError::Configuration(format!(
            "Invalid idempotency key path '{}': {}",
            expression, reason
        ))
    };

    if path.is_empty() {
        return Err(invalid("empty path segment"));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(invalid("empty path segment"));
        }

        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            if !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                return Err(invalid("field names may only contain letters, digits, '_' or '-'"));
            }
            segments.push(Segment::Field(name.to_string()));
        } else if segments.is_empty() && rest.is_empty() {
            return Err(invalid("empty path segment"));
        }

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let index = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid("array index must be a non-negative integer"))?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid("unexpected characters after ']'"));
            }
        }
    }

    Ok(segments)
}

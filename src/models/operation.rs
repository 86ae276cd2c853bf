//! GraphQL operation envelope and the record kept for each capture
//!
//! Envelopes are decoded leniently: a field with an unexpected shape is
//! treated as absent instead of failing the whole element.

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Name recorded when an element carries no `operationName`
pub const ANONYMOUS_OPERATION: &str = "anonymous";

/// Characters of a persisted-query hash shown in the log line
const HASH_PREVIEW_CHARS: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEnvelope {
    #[serde(default, deserialize_with = "lenient")]
    pub operation_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, deserialize_with = "lenient")]
    pub extensions: Option<Extensions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default, deserialize_with = "lenient")]
    pub persisted_query: Option<PersistedQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PersistedQuery {
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<i64>,
    #[serde(default, rename = "sha256Hash", deserialize_with = "lenient")]
    pub sha256_hash: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// One operation pulled out of an intercepted request body.
#[derive(Debug, Clone)]
pub struct CapturedOperation {
    pub name: String,
    /// The element exactly as it appeared in the body
    pub raw: Box<RawValue>,
    pub query: Option<String>,
    pub variables: Option<Map<String, Value>>,
    pub persisted_query: Option<PersistedQuery>,
    pub captured_at: DateTime<Local>,
    /// First occurrence of `name` in this process
    pub first_seen: bool,
}

impl CapturedOperation {
    /// Decode one batch element. Returns `None` when the element is not a JSON object.
    ///
    /// The element goes through a [`Value`] first so a repeated key keeps its
    /// last occurrence instead of failing the derived decoder.
    pub fn from_raw(raw: Box<RawValue>) -> Option<Self> {
        let value: Value = serde_json::from_str(raw.get()).ok()?;
        if !value.is_object() {
            return None;
        }
        let envelope: OperationEnvelope = serde_json::from_value(value).ok()?;
        let name = match envelope.operation_name {
            Some(name) if !name.is_empty() => name,
            _ => ANONYMOUS_OPERATION.to_string(),
        };

        Some(Self {
            name,
            raw,
            query: envelope.query,
            variables: envelope.variables,
            persisted_query: envelope.extensions.and_then(|ext| ext.persisted_query),
            captured_at: Local::now(),
            first_seen: false,
        })
    }

    pub fn persisted_hash(&self) -> Option<&str> {
        self.persisted_query
            .as_ref()
            .and_then(|pq| pq.sha256_hash.as_deref())
    }

    /// Operator-facing summary: `* [15:04:05] Name [hash: 0123456789abcdef...]`
    pub fn log_line(&self) -> String {
        let marker = if self.first_seen { '*' } else { ' ' };
        let mut line = format!(
            "{} [{}] {}",
            marker,
            self.captured_at.format("%H:%M:%S"),
            self.name
        );
        if let Some(hash) = self.persisted_hash() {
            if hash.chars().count() > HASH_PREVIEW_CHARS {
                let preview: String = hash.chars().take(HASH_PREVIEW_CHARS).collect();
                line.push_str(&format!(" [hash: {preview}...]"));
            }
        }
        line
    }
}

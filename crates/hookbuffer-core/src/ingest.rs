use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{DebounceError, Revision, ThreadKey};

/// Where a webhook's payloads carry their thread id and revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    pub name: String,
    pub thread_id_path: Vec<String>,
    pub revision_path: Vec<String>,
}

impl WebhookConfig {
    /// Validates a webhook registration before it is stored.
    ///
    /// # Errors
    /// Returns [`DebounceError::Validation`] when the name or thread id path
    /// is empty, or a path contains an empty segment.
    pub fn validate(&self) -> Result<(), DebounceError> {
        if self.name.trim().is_empty() {
            return Err(DebounceError::Validation(
                "webhook name MUST be provided".to_string(),
            ));
        }

        if self.thread_id_path.is_empty() {
            return Err(DebounceError::Validation(
                "thread_id_path MUST contain at least one segment".to_string(),
            ));
        }

        for (name, path) in [
            ("thread_id_path", &self.thread_id_path),
            ("revision_path", &self.revision_path),
        ] {
            if path.iter().any(|segment| segment.is_empty()) {
                return Err(DebounceError::Validation(format!(
                    "{name} segments MUST be non-empty"
                )));
            }
        }

        Ok(())
    }

    /// Splits a dotted path such as `data.items.0.id` into segments.
    /// The empty string is the empty path.
    #[must_use]
    pub fn parse_path(raw: &str) -> Vec<String> {
        if raw.is_empty() {
            return Vec::new();
        }
        raw.split('.').map(str::to_string).collect()
    }
}

/// The ingestion write contract: what a producer appends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewUpdate {
    pub thread_key: ThreadKey,
    pub revision: Revision,
    pub payload: Value,
}

/// Walks `path` through `value`. All-digit segments index arrays; every
/// segment also matches an object key of the same text.
#[must_use]
pub fn value_at_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                if !segment.bytes().all(|byte| byte.is_ascii_digit()) {
                    return None;
                }
                items.get(segment.parse::<usize>().ok()?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Builds the update a webhook payload describes.
///
/// A missing or non-string thread id puts the update on a fresh thread of
/// its own. An empty revision path, or a missing or unparseable revision,
/// defaults to `received_at`.
#[must_use]
pub fn resolve_update(
    webhook: &WebhookConfig,
    payload: Value,
    received_at: OffsetDateTime,
) -> NewUpdate {
    let thread_id = match value_at_path(&payload, &webhook.thread_id_path) {
        Some(Value::String(raw)) if !raw.is_empty() => raw.clone(),
        _ => Ulid::new().to_string(),
    };

    let revision = Some(webhook.revision_path.as_slice())
        .filter(|path| !path.is_empty())
        .and_then(|path| value_at_path(&payload, path))
        .and_then(revision_from_json)
        .unwrap_or_else(|| Revision::from_datetime(received_at));

    NewUpdate {
        thread_key: ThreadKey::new(webhook.name.clone(), thread_id),
        revision,
        payload,
    }
}

fn revision_from_json(value: &Value) -> Option<Revision> {
    let raw = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Revision::new(raw).ok()
}

//! Buffered webhook threads with debounced, coalesced delivery.
//!
//! Producers append updates keyed by a [`ThreadKey`] and ordered by a
//! caller-supplied [`Revision`]. Consumers call [`DebounceEngine::acquire`]
//! to claim exactly one thread, receive only its newest pending update,
//! and finalize the outcome through the returned [`ScopedUpdate`].
//!
//! All exclusion is expressed through the capabilities of a
//! [`DebounceStore`]; the engine holds no shared in-process state.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

mod engine;
mod ingest;
pub mod memory;
mod store;

pub use engine::{
    coalesce, CoalescePlan, DebounceEngine, ProcessError, ScopedUpdate, NO_BUFFER,
};
pub use ingest::{resolve_update, value_at_path, NewUpdate, WebhookConfig};
pub use store::{DebounceStore, DebounceTransaction};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DebounceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("lock lost: {0}")]
    LockLost(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UpdateId(pub i64);

impl Display for UpdateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The coalescing unit: one producer-assigned thread within one webhook.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadKey {
    pub webhook_name: String,
    pub thread_id: String,
}

impl ThreadKey {
    #[must_use]
    pub fn new(webhook_name: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            webhook_name: webhook_name.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl Display for ThreadKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.webhook_name, self.thread_id)
    }
}

/// Ordering key deciding which buffered update of a thread is authoritative.
///
/// Always finite; `-0.0` is normalized to `0.0` so equality and ordering agree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Revision(f64);

impl Revision {
    /// Wraps a finite revision number.
    ///
    /// # Errors
    /// Returns [`DebounceError::Validation`] for NaN or infinite values.
    pub fn new(value: f64) -> Result<Self, DebounceError> {
        if !value.is_finite() {
            return Err(DebounceError::Validation(format!(
                "revision MUST be a finite number, got {value}"
            )));
        }
        Ok(Self(if value == 0.0 { 0.0 } else { value }))
    }

    /// Fractional Unix seconds of `at`, the default revision of an update
    /// whose producer supplied none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_datetime(at: OffsetDateTime) -> Self {
        Self(at.unix_timestamp_nanos() as f64 / 1_000_000_000.0)
    }

    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Revision {}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl TryFrom<f64> for Revision {
    type Error = DebounceError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Revision> for f64 {
    fn from(value: Revision) -> Self {
        value.0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Pending,
    Skipped,
    Success,
    Error,
}

impl UpdateStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "skipped" => Some(Self::Skipped),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One buffered event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadUpdate {
    pub id: UpdateId,
    pub thread_key: ThreadKey,
    pub revision: Revision,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub arrived_at: OffsetDateTime,
    pub status: UpdateStatus,
}

/// Registry row for one thread key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub key: ThreadKey,
    pub last_delivered_revision: Option<Revision>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DebounceError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DebounceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DebounceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DebounceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DebounceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DebounceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            DebounceError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Whole milliseconds since the Unix epoch, the storage form of timestamps
/// that take part in range comparisons.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Inverse of [`unix_millis`].
///
/// # Errors
/// Returns [`DebounceError::Validation`] when the value is outside the
/// representable date range.
pub fn from_unix_millis(value: i64) -> Result<OffsetDateTime, DebounceError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000).map_err(|err| {
        DebounceError::Validation(format!("invalid unix millisecond timestamp {value}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn revision_rejects_non_finite_values() {
        assert!(Revision::new(f64::NAN).is_err());
        assert!(Revision::new(f64::INFINITY).is_err());
        assert!(Revision::new(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn revision_ordering_is_total_and_zero_is_normalized() {
        let negative_zero = must_ok(Revision::new(-0.0));
        let zero = must_ok(Revision::new(0.0));
        assert_eq!(negative_zero, zero);

        let mut values = vec![
            must_ok(Revision::new(3.0)),
            must_ok(Revision::new(-1.5)),
            must_ok(Revision::new(2.0)),
        ];
        values.sort();
        let raw: Vec<f64> = values.into_iter().map(Revision::value).collect();
        assert_eq!(raw, vec![-1.5, 2.0, 3.0]);
    }

    #[test]
    fn revision_deserialization_rejects_nan_like_input() {
        let parsed: Result<Revision, _> = serde_json::from_str("1e400");
        assert!(parsed.is_err());

        let parsed: Revision = must_ok(serde_json::from_str("5.0"));
        assert_eq!(parsed.value(), 5.0);
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in [
            UpdateStatus::Pending,
            UpdateStatus::Skipped,
            UpdateStatus::Success,
            UpdateStatus::Error,
        ] {
            assert_eq!(UpdateStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UpdateStatus::parse("PENDING"), None);
        assert!(!UpdateStatus::Pending.is_terminal());
        assert!(UpdateStatus::Skipped.is_terminal());
    }

    #[test]
    fn unix_millis_round_trip_truncates_sub_millisecond_precision() {
        let at = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00.123456Z"));
        let millis = unix_millis(at);
        let back = must_ok(from_unix_millis(millis));
        assert_eq!(must_ok(format_rfc3339(back)), "2026-02-07T12:00:00.123Z");
    }

    #[test]
    fn parse_rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn thread_key_displays_as_webhook_slash_thread() {
        assert_eq!(ThreadKey::new("github", "pr-42").to_string(), "github/pr-42");
    }
}

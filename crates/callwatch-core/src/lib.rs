//! Domain types and pure reconciliation/history rules for the callwatch engine.
//!
//! Nothing in this crate touches storage or the network. The `SQLite` store and
//! the poller build on these types and on the planning functions in
//! [`plan_reconciliation`] and [`HistoryOptions::apply`].

mod history;
mod reconcile;
mod record;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub use history::HistoryOptions;
pub use reconcile::{plan_reconciliation, ReconciliationPlan};
pub use record::{is_closed_status, CallRecord, CLOSED_STATUS};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CallwatchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T, E = CallwatchError> = std::result::Result<T, E>;

/// Controls whether a newer non-closed observation may revive a stored
/// `Closed` row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Recency alone decides; a strictly newer open status replaces `Closed`.
    #[default]
    AllowNewer,
    /// Once stored as `Closed`, only closed observations are accepted.
    Never,
}

impl ReopenPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowNewer => "allow_newer",
            Self::Never => "never",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow_newer" => Some(Self::AllowNewer),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub discarded: usize,
}

impl UpsertReport {
    #[must_use]
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub snapshot_rows: usize,
    pub synthesized_closures: usize,
    pub inserted: usize,
    pub updated: usize,
    pub discarded: usize,
}

impl ReconcileReport {
    #[must_use]
    pub fn from_upsert(snapshot_rows: usize, synthesized_closures: usize, upsert: UpsertReport) -> Self {
        Self {
            snapshot_rows,
            synthesized_closures,
            inserted: upsert.inserted,
            updated: upsert.updated,
            discarded: upsert.discarded,
        }
    }
}

/// Parses a timestamp as delivered by the call feed.
///
/// RFC3339 values keep their instant and are normalized to UTC. Values without
/// an offset (`2024-03-01T10:15:00` or `2024-03-01 10:15:00.250`) are read as UTC.
///
/// # Errors
/// Returns [`CallwatchError::Validation`] when no accepted layout matches.
pub fn parse_feed_timestamp(value: &str) -> Result<OffsetDateTime> {
    let trimmed = value.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    let normalized = if trimmed.as_bytes().get(10) == Some(&b' ') {
        trimmed.replacen(' ', "T", 1)
    } else {
        trimmed.to_string()
    };

    let with_fraction =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let whole_seconds = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

    PrimitiveDateTime::parse(&normalized, &with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(&normalized, &whole_seconds))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| CallwatchError::Validation(format!("invalid timestamp {value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CallwatchError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| CallwatchError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Unix milliseconds, floored. Used as the ordering key of the creation index.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos().div_euclid(1_000_000);
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

/// Serde adapter for feed timestamps: lenient on input, RFC3339 UTC on output.
pub mod feed_time {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the input is not a string in an accepted layout.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_feed_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

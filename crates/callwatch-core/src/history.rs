use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{CallRecord, CallwatchError, Result};

/// Filters for browsing closed incidents. Every field is optional; the default
/// returns the whole closed history, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryOptions {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryOptions {
    /// Rejects an inverted range. Query execution does not call this; an
    /// inverted range simply matches nothing there.
    ///
    /// # Errors
    /// Returns [`CallwatchError::Validation`] when the range is inverted.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(CallwatchError::Validation(
                    "start_date MUST NOT be after end_date".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_range(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }

    /// Inclusive on both ends; a missing bound is open.
    #[must_use]
    pub fn contains_creation(&self, creation: OffsetDateTime) -> bool {
        self.start_date.map_or(true, |start| creation >= start)
            && self.end_date.map_or(true, |end| creation <= end)
    }

    /// Lower-cased search text, matched as is. Only an empty string disables
    /// the filter; whitespace is significant.
    fn needle(&self) -> Option<String> {
        self.search_text
            .as_deref()
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase)
    }

    /// Applies the closed-only, range, search, sort and limit stages to
    /// candidate rows. Candidates may be a superset of the range.
    #[must_use]
    pub fn apply(&self, candidates: Vec<CallRecord>) -> Vec<CallRecord> {
        let needle = self.needle();
        let mut rows: Vec<CallRecord> = candidates
            .into_iter()
            .filter(CallRecord::is_closed)
            .filter(|record| self.contains_creation(record.creation_timestamp))
            .filter(|record| needle.as_deref().map_or(true, |text| record.matches_search(text)))
            .collect();

        // Stable sort keeps storage order among equal creation times.
        rows.sort_by(|lhs, rhs| rhs.creation_timestamp.cmp(&lhs.creation_timestamp));

        // A limit of zero means unlimited.
        if let Some(limit) = self.limit.filter(|limit| *limit > 0) {
            rows.truncate(limit);
        }
        rows
    }
}

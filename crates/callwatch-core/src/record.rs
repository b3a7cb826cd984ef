use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::feed_time;

pub const CLOSED_STATUS: &str = "Closed";

#[must_use]
pub fn is_closed_status(status: &str) -> bool {
    status.eq_ignore_ascii_case(CLOSED_STATUS)
}

/// One observation of an emergency incident, keyed remotely by `entity_id`.
///
/// Field names on the wire follow the call feed (`master_incident_id`,
/// `statusdatetime`, `creation`, ...). `local_key` never comes from the feed;
/// the store assigns it on first insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<i64>,
    #[serde(rename = "master_incident_id")]
    pub entity_id: i64,
    #[serde(rename = "sequencenumber", default, deserialize_with = "nullable_text")]
    pub sequence_number: String,
    pub status: String,
    #[serde(rename = "statusdatetime", with = "feed_time")]
    pub status_timestamp: OffsetDateTime,
    #[serde(rename = "creation", with = "feed_time")]
    pub creation_timestamp: OffsetDateTime,
    #[serde(default, deserialize_with = "nullable_text")]
    pub zone: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub location: String,
    #[serde(rename = "crossstreets", default, deserialize_with = "nullable_text")]
    pub cross_streets: String,
    #[serde(default)]
    pub premise: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    pub priority: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub agency_type: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub jurisdiction: String,
    #[serde(rename = "type", default, deserialize_with = "nullable_text")]
    pub call_type: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub type_description: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub city: String,
    #[serde(default, deserialize_with = "nullable_text")]
    pub state: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "nullable_text")]
    pub battalion: String,
    #[serde(default, deserialize_with = "nullable_flag")]
    pub stacked: bool,
    #[serde(default)]
    pub entered_queue: Option<String>,
}

impl CallRecord {
    /// Minimal record with empty descriptive fields.
    #[must_use]
    pub fn new(
        entity_id: i64,
        status: impl Into<String>,
        status_timestamp: OffsetDateTime,
        creation_timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            local_key: None,
            entity_id,
            sequence_number: String::new(),
            status: status.into(),
            status_timestamp,
            creation_timestamp,
            zone: String::new(),
            location: String::new(),
            cross_streets: String::new(),
            premise: None,
            priority: String::new(),
            agency_type: String::new(),
            jurisdiction: String::new(),
            call_type: String::new(),
            type_description: String::new(),
            city: String::new(),
            state: String::new(),
            latitude: None,
            longitude: None,
            battalion: String::new(),
            stacked: false,
            entered_queue: None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        is_closed_status(&self.status)
    }

    /// The same incident, marked `Closed` as of `at`. Every other field is kept.
    #[must_use]
    pub fn closed_at(&self, at: OffsetDateTime) -> Self {
        Self {
            status: CLOSED_STATUS.to_string(),
            status_timestamp: at,
            ..self.clone()
        }
    }

    /// `needle` must already be lower-cased.
    #[must_use]
    pub fn matches_search(&self, needle: &str) -> bool {
        self.location.to_lowercase().contains(needle)
            || self.type_description.to_lowercase().contains(needle)
            || self
                .premise
                .as_deref()
                .is_some_and(|premise| premise.to_lowercase().contains(needle))
            || self.sequence_number.to_lowercase().contains(needle)
    }
}

fn nullable_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

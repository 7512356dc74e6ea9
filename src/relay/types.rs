// src/relay/types.rs
//! Wire types of the relay log and the notifications dispatched from it.

use crate::error::SyncError;
use crate::utils::now_millis;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// `source` stamped on every dispatched notification.
pub const NOTIFICATION_SOURCE: &str = "cross-browser";

const RESERVED_DETAIL_KEYS: [&str; 4] = ["movieId", "timestamp", "source", "browserId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "rating-updated")]
    RatingUpdated,
    #[serde(rename = "rating-stats-updated")]
    RatingStatsUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RatingUpdated => "rating-updated",
            EventKind::RatingStatsUpdated => "rating-stats-updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rating-updated" => Ok(EventKind::RatingUpdated),
            "rating-stats-updated" => Ok(EventKind::RatingStatsUpdated),
            other => Err(SyncError::ParseError(format!("Unknown event kind: {}", other))),
        }
    }
}

/// One entry of the shared relay log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Empty for entries written without ids; those dedup by timestamp alone.
    #[serde(default)]
    pub id: String,
    pub kind: EventKind,
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(rename = "emittedAt")]
    pub emitted_at: u64,
    #[serde(rename = "originId")]
    pub origin_id: String,
}

impl RelayEvent {
    pub fn new(
        kind: EventKind,
        subject_id: impl Into<String>,
        payload: Map<String, Value>,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            subject_id: subject_id.into(),
            payload,
            emitted_at: now_millis(),
            origin_id: origin_id.into(),
        }
    }
}

/// Decodes the JSON array stored under the relay log key.
pub fn decode_log(raw: &str) -> Result<Vec<RelayEvent>, SyncError> {
    serde_json::from_str(raw).map_err(|e| SyncError::ParseError(format!("Malformed relay log: {}", e)))
}

/// Body of a dispatched notification:
/// `{movieId, ...payload, timestamp, source, browserId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDetail {
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub timestamp: u64,
    pub source: String,
    #[serde(rename = "browserId")]
    pub browser_id: String,
}

impl NotificationDetail {
    /// Reads the merged payload back as a typed value, e.g. rating stats.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayNotification {
    pub kind: EventKind,
    pub detail: NotificationDetail,
}

impl From<&RelayEvent> for RelayNotification {
    fn from(event: &RelayEvent) -> Self {
        let mut payload = event.payload.clone();
        for key in RESERVED_DETAIL_KEYS {
            payload.remove(key);
        }
        Self {
            kind: event.kind,
            detail: NotificationDetail {
                movie_id: event.subject_id.clone(),
                payload,
                timestamp: event.emitted_at,
                source: NOTIFICATION_SOURCE.to_string(),
                browser_id: event.origin_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    #[serde(rename = "originId")]
    pub origin_id: String,
    #[serde(rename = "isPolling")]
    pub is_polling: bool,
    #[serde(rename = "pollInterval", serialize_with = "serialize_millis")]
    pub poll_interval: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Counters since the relay was constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayMetrics {
    pub events_emitted: u64,
    pub publish_failures: u64,
    pub notifications_dispatched: u64,
    pub poll_failures: u64,
}

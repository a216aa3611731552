use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{EventKind, EventStatus};

/// A company account. Corresponds to the `companies` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub password: String,
    pub blocked: bool,
}

/// A guarded location. Corresponds to the `service_posts` table.
/// `last_heartbeat` is `None` while no monitoring session holds the post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub location: String,
    pub blocked: bool,
    pub access_secret: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Corresponds to the `monitoring_events` table. Field names follow the
/// column names so the change-feed payload deserializes directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringEvent {
    pub id: i64,
    pub post_id: i64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default)]
    pub comment: Option<String>,
}

/// An event about to be inserted. A `None` timestamp lets the store stamp it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub post_id: i64,
    pub kind: EventKind,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

impl NewEvent {
    pub fn unresolved(post_id: i64, kind: EventKind) -> Self {
        Self {
            post_id,
            kind,
            timestamp: None,
            status: EventStatus::Unresolved,
        }
    }

    pub fn captured_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The mutable fields of an event. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub status: Option<EventStatus>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureCount {
    pub post_id: i64,
    pub count: i64,
}

/// Daily compliance window of a post. Corresponds to `alerta_vigia_configs`.
/// Times are wall-clock times of day, interpreted in the viewer's local zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceConfig {
    pub post_id: i64,
    #[serde(with = "time_of_day")]
    pub activation_time: NaiveTime,
    #[serde(with = "time_of_day")]
    pub deactivation_time: NaiveTime,
    pub progress_duration_minutes: i32,
    pub alert_sound_seconds: i32,
}

impl ComplianceConfig {
    /// The configuration new posts start with: 22:00 to 06:00, a 30 minute
    /// progress window and a 60 second alert tone.
    pub fn default_for(post_id: i64) -> Self {
        Self {
            post_id,
            activation_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
            deactivation_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            progress_duration_minutes: 30,
            alert_sound_seconds: 60,
        }
    }
}

/// Parses `HH:MM` (or `HH:MM:SS`) into a time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, String> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|e| format!("Invalid time of day '{value}': {e}"))
}

pub fn format_time_of_day(time: &NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_time_of_day(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_of_day_accepts_both_forms() {
        assert_eq!(
            parse_time_of_day("22:00").unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day(" 06:05:00 ").unwrap(),
            NaiveTime::from_hms_opt(6, 5, 0).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_feed_row_deserializes() {
        let raw = r#"{"id":7,"post_id":3,"type":"Botão de Pânico","timestamp":"2026-10-19T22:05:00.123456+00:00","status":"Não Resolvido","comment":null}"#;
        let event: MonitoringEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id, 7);
        assert_eq!(event.kind, EventKind::PanicButton);
        assert_eq!(event.status, EventStatus::Unresolved);
        assert!(event.comment.is_none());
    }

    #[test]
    fn test_compliance_config_serializes_short_times() {
        let config = ComplianceConfig::default_for(9);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["activation_time"], "22:00");
        assert_eq!(value["deactivation_time"], "06:00");
    }
}

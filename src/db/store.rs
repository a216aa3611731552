use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use super::enums::EventKind;
use super::models::{
    Company, ComplianceConfig, EventPatch, FailureCount, MonitoringEvent, NewEvent, Post,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unreachable(String),
    #[error("Access denied by store policy: {0}")]
    PolicyDenied(String),
    #[error("Store schema is missing or incomplete: {0}")]
    SchemaMissing(String),
    #[error("Row not found: {0}")]
    NotFound(String),
    #[error("Invalid row data: {0}")]
    InvalidRow(String),
    #[error("Database error: {0}")]
    Database(String),
}

/// Failure classes the rest of the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No network path to the store. Writes get queued, reads retried later.
    Connectivity,
    /// Rejected by an access policy. Surfaced verbatim, never retried.
    Policy,
    /// The expected schema is absent. Fatal for the session.
    Integrity,
    Other,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Unreachable(_) => ErrorClass::Connectivity,
            StoreError::PolicyDenied(_) => ErrorClass::Policy,
            StoreError::SchemaMissing(_) => ErrorClass::Integrity,
            StoreError::NotFound(_) | StoreError::InvalidRow(_) | StoreError::Database(_) => {
                ErrorClass::Other
            }
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // undefined_table, undefined_column, undefined_function
                Some("42P01") | Some("42703") | Some("42883") => {
                    StoreError::SchemaMissing(db_err.message().to_string())
                }
                // insufficient_privilege
                Some("42501") => StoreError::PolicyDenied(db_err.message().to_string()),
                _ => StoreError::Database(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unreachable(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::InvalidRow(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One committed change on the events table, as delivered by the change-feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChange {
    pub operation: ChangeOperation,
    pub row: MonitoringEvent,
}

/// What the change-feed delivers. `Gap` means changes may have been missed
/// (a fresh or re-established connection) and the reader should reload.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(EventChange),
    Gap,
}

impl FeedMessage {
    pub fn into_change(self) -> Option<EventChange> {
        match self {
            FeedMessage::Change(change) => Some(change),
            FeedMessage::Gap => None,
        }
    }
}

pub type EventFeed = broadcast::Receiver<FeedMessage>;

/// Filters for `list_events`. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub post_id: Option<i64>,
    pub kind: Option<EventKind>,
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on the comment.
    pub comment_contains: Option<String>,
    /// Oldest first when set; newest first otherwise.
    pub ascending: bool,
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn for_post(post_id: i64) -> Self {
        Self {
            post_id: Some(post_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &MonitoringEvent) -> bool {
        if self.post_id.is_some_and(|id| id != event.post_id) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != event.kind) {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if let Some(needle) = &self.comment_contains {
            let needle = needle.to_lowercase();
            match &event.comment {
                Some(comment) if comment.to_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }
        true
    }
}

/// The persistent store the engine runs against: row CRUD over posts,
/// events, failure counters and compliance configs, plus the event
/// change-feed.
#[async_trait]
pub trait MonitoringStore: Send + Sync {
    async fn find_company_by_username(&self, username: &str)
        -> Result<Option<Company>, StoreError>;

    async fn list_posts(&self) -> Result<Vec<Post>, StoreError>;

    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, StoreError>;

    async fn find_post_by_credentials(
        &self,
        post_id: i64,
        access_secret: &str,
    ) -> Result<Option<Post>, StoreError>;

    /// Writes `last_heartbeat`; `None` marks the post as not monitored.
    async fn set_heartbeat(
        &self,
        post_id: i64,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn insert_event(&self, event: NewEvent) -> Result<MonitoringEvent, StoreError>;

    /// Inserts the whole batch or nothing.
    async fn insert_events(&self, events: Vec<NewEvent>)
        -> Result<Vec<MonitoringEvent>, StoreError>;

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<MonitoringEvent>, StoreError>;

    async fn update_event(&self, event_id: i64, patch: EventPatch) -> Result<(), StoreError>;

    async fn delete_event(&self, event_id: i64) -> Result<(), StoreError>;

    async fn failure_count(&self, post_id: i64) -> Result<Option<i64>, StoreError>;

    async fn list_failure_counts(&self) -> Result<Vec<FailureCount>, StoreError>;

    /// Upsert keyed by `post_id`.
    async fn upsert_failure_count(&self, post_id: i64, count: i64) -> Result<(), StoreError>;

    async fn list_compliance_configs(&self) -> Result<Vec<ComplianceConfig>, StoreError>;

    /// Upsert keyed by `post_id`.
    async fn upsert_compliance_config(&self, config: &ComplianceConfig) -> Result<(), StoreError>;

    async fn subscribe_events(&self) -> Result<EventFeed, StoreError>;

    async fn find_post_name(&self, post_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.find_post(post_id).await?.map(|post| post.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::EventStatus;
    use chrono::TimeZone;

    fn event(post_id: i64, kind: EventKind, comment: Option<&str>) -> MonitoringEvent {
        MonitoringEvent {
            id: 1,
            post_id,
            kind,
            timestamp: Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap(),
            status: EventStatus::Unresolved,
            comment: comment.map(str::to_string),
        }
    }

    #[test]
    fn test_filter_matches_equality_and_substring() {
        let filter = EventFilter {
            post_id: Some(4),
            comment_contains: Some("PORTÃO".to_string()),
            ..EventFilter::default()
        };
        assert!(filter.matches(&event(4, EventKind::PanicButton, Some("alarme no portão"))));
        assert!(!filter.matches(&event(5, EventKind::PanicButton, Some("portão"))));
        assert!(!filter.matches(&event(4, EventKind::PanicButton, None)));
    }

    #[test]
    fn test_filter_since_and_kind() {
        let filter = EventFilter {
            kind: Some(EventKind::SystemActivated),
            since: Some(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()),
            ..EventFilter::default()
        };
        assert!(filter.matches(&event(1, EventKind::SystemActivated, None)));
        assert!(!filter.matches(&event(1, EventKind::GatehouseOnline, None)));

        let later = EventFilter {
            since: Some(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 1).unwrap()),
            ..EventFilter::default()
        };
        assert!(!later.matches(&event(1, EventKind::SystemActivated, None)));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            StoreError::Unreachable("down".into()).class(),
            ErrorClass::Connectivity
        );
        assert_eq!(
            StoreError::SchemaMissing("companies".into()).class(),
            ErrorClass::Integrity
        );
        assert_eq!(StoreError::PolicyDenied("rls".into()).class(), ErrorClass::Policy);
        assert_eq!(StoreError::from(sqlx::Error::PoolTimedOut).class(), ErrorClass::Connectivity);
        assert_eq!(StoreError::from(sqlx::Error::RowNotFound).class(), ErrorClass::Other);
    }

    #[test]
    fn test_change_payload_deserializes() {
        let raw = r#"{"operation":"DELETE","row":{"id":11,"post_id":2,"type":"Portaria Online","timestamp":"2026-10-19T08:00:00+00:00","status":"Resolvido","comment":"ok"}}"#;
        let change: EventChange = serde_json::from_str(raw).unwrap();
        assert_eq!(change.operation, ChangeOperation::Delete);
        assert_eq!(change.row.id, 11);
        assert_eq!(change.row.status, EventStatus::Resolved);
    }
}

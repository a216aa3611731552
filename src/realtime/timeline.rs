use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::{EventStatus, MonitoringEvent};

pub const UNKNOWN_POST_NAME: &str = "Unknown post";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    #[serde(flatten)]
    pub event: MonitoringEvent,
    pub post_name: String,
}

/// In-memory event history, newest first. Each event id appears at most once.
#[derive(Debug, Default)]
pub struct Timeline {
    events: RwLock<Vec<TimelineEvent>>,
}

impl Timeline {
    pub fn new(events: Vec<TimelineEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    pub async fn replace_all(&self, events: Vec<TimelineEvent>) {
        *self.events.write().await = events;
    }

    /// Prepends `entry`, dropping any older copy with the same id.
    pub async fn insert_front_dedup(&self, entry: TimelineEvent) {
        let mut events = self.events.write().await;
        events.retain(|existing| existing.event.id != entry.event.id);
        events.insert(0, entry);
    }

    /// Copies the mutable fields of `row` onto the matching entry. Returns
    /// false when the id is unknown.
    pub async fn apply_update(&self, row: &MonitoringEvent) -> bool {
        let mut events = self.events.write().await;
        match events.iter_mut().find(|existing| existing.event.id == row.id) {
            Some(existing) => {
                existing.event.status = row.status;
                existing.event.comment = row.comment.clone();
                existing.event.kind = row.kind;
                existing.event.timestamp = row.timestamp;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, event_id: i64) -> bool {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|existing| existing.event.id != event_id);
        events.len() != before
    }

    pub async fn set_comment(&self, event_id: i64, comment: &str) -> bool {
        let mut events = self.events.write().await;
        match events.iter_mut().find(|existing| existing.event.id == event_id) {
            Some(existing) => {
                existing.event.comment = Some(comment.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, event_id: i64, status: EventStatus) -> bool {
        let mut events = self.events.write().await;
        match events.iter_mut().find(|existing| existing.event.id == event_id) {
            Some(existing) => {
                existing.event.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, event_id: i64) -> Option<TimelineEvent> {
        self.events
            .read()
            .await
            .iter()
            .find(|existing| existing.event.id == event_id)
            .cloned()
    }

    /// Events of one post, newest first.
    pub async fn events_for_post(&self, post_id: i64) -> Vec<MonitoringEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|entry| entry.event.post_id == post_id)
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<TimelineEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

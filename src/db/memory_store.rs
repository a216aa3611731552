//! In-process store with a broadcast change-feed. Backs `--demo` runs and the
//! test suites; faults can be injected per table.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::models::{
    Company, ComplianceConfig, EventPatch, FailureCount, MonitoringEvent, NewEvent, Post,
};
use super::store::{
    ChangeOperation, EventChange, EventFeed, EventFilter, FeedMessage, MonitoringStore, StoreError,
};

#[derive(Default)]
struct Tables {
    companies: BTreeMap<i64, Company>,
    posts: BTreeMap<i64, Post>,
    events: BTreeMap<i64, MonitoringEvent>,
    failures: BTreeMap<i64, i64>,
    configs: BTreeMap<i64, ComplianceConfig>,
    next_event_id: i64,
}

#[derive(Default)]
struct Faults {
    unreachable: AtomicBool,
    event_writes: AtomicBool,
    counter_writes: AtomicBool,
    heartbeat_writes: AtomicBool,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Faults,
    feed_tx: broadcast::Sender<FeedMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(256);
        Self {
            tables: Mutex::new(Tables {
                next_event_id: 1,
                ..Tables::default()
            }),
            faults: Faults::default(),
            feed_tx,
        }
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".to_string()))
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("simulated network outage".to_string()));
        }
        Ok(())
    }

    fn check_fault(&self, flag: &AtomicBool, table: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Database(format!("simulated write failure on {table}")));
        }
        Ok(())
    }

    fn publish(&self, operation: ChangeOperation, row: MonitoringEvent) {
        // No subscribers is fine.
        let _ = self.feed_tx.send(FeedMessage::Change(EventChange { operation, row }));
    }

    // --- Seeding and fault injection ---

    pub fn add_company(&self, company: Company) {
        if let Ok(mut tables) = self.tables() {
            tables.companies.insert(company.id, company);
        }
    }

    pub fn add_post(&self, post: Post) {
        if let Ok(mut tables) = self.tables() {
            tables.posts.insert(post.id, post);
        }
    }

    pub fn put_compliance_config(&self, config: ComplianceConfig) {
        if let Ok(mut tables) = self.tables() {
            tables.configs.insert(config.post_id, config);
        }
    }

    pub fn put_failure_count(&self, post_id: i64, count: i64) {
        if let Ok(mut tables) = self.tables() {
            tables.failures.insert(post_id, count);
        }
    }

    /// Rows currently stored, oldest first.
    pub fn stored_events(&self) -> Vec<MonitoringEvent> {
        self.tables()
            .map(|tables| tables.events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stored_post(&self, post_id: i64) -> Option<Post> {
        self.tables().ok().and_then(|tables| tables.posts.get(&post_id).cloned())
    }

    pub fn stored_failure_count(&self, post_id: i64) -> Option<i64> {
        self.tables().ok().and_then(|tables| tables.failures.get(&post_id).copied())
    }

    pub fn set_unreachable(&self, value: bool) {
        self.faults.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn fail_event_writes(&self, value: bool) {
        self.faults.event_writes.store(value, Ordering::SeqCst);
    }

    pub fn fail_counter_writes(&self, value: bool) {
        self.faults.counter_writes.store(value, Ordering::SeqCst);
    }

    pub fn fail_heartbeat_writes(&self, value: bool) {
        self.faults.heartbeat_writes.store(value, Ordering::SeqCst);
    }

    /// Tells subscribers that changes may have been missed, as a dropped
    /// database connection would.
    pub fn signal_feed_gap(&self) {
        let _ = self.feed_tx.send(FeedMessage::Gap);
    }

    fn materialize(tables: &mut Tables, event: NewEvent, now: DateTime<Utc>) -> MonitoringEvent {
        let id = tables.next_event_id;
        tables.next_event_id += 1;
        let row = MonitoringEvent {
            id,
            post_id: event.post_id,
            kind: event.kind,
            timestamp: event.timestamp.unwrap_or(now),
            status: event.status,
            comment: None,
        };
        tables.events.insert(id, row.clone());
        row
    }
}

#[async_trait]
impl MonitoringStore for MemoryStore {
    async fn find_company_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Company>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .tables()?
            .companies
            .values()
            .find(|company| company.username == username)
            .cloned())
    }

    async fn list_posts(&self) -> Result<Vec<Post>, StoreError> {
        self.check_reachable()?;
        Ok(self.tables()?.posts.values().cloned().collect())
    }

    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, StoreError> {
        self.check_reachable()?;
        Ok(self.tables()?.posts.get(&post_id).cloned())
    }

    async fn find_post_by_credentials(
        &self,
        post_id: i64,
        access_secret: &str,
    ) -> Result<Option<Post>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .tables()?
            .posts
            .get(&post_id)
            .filter(|post| post.access_secret == access_secret)
            .cloned())
    }

    async fn set_heartbeat(
        &self,
        post_id: i64,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.check_fault(&self.faults.heartbeat_writes, "service_posts")?;
        let mut tables = self.tables()?;
        let post = tables
            .posts
            .get_mut(&post_id)
            .ok_or_else(|| StoreError::NotFound(format!("post {post_id}")))?;
        post.last_heartbeat = at;
        Ok(())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<MonitoringEvent, StoreError> {
        self.check_fault(&self.faults.event_writes, "monitoring_events")?;
        let row = {
            let mut tables = self.tables()?;
            Self::materialize(&mut tables, event, Utc::now())
        };
        self.publish(ChangeOperation::Insert, row.clone());
        Ok(row)
    }

    async fn insert_events(
        &self,
        events: Vec<NewEvent>,
    ) -> Result<Vec<MonitoringEvent>, StoreError> {
        self.check_fault(&self.faults.event_writes, "monitoring_events")?;
        let rows: Vec<MonitoringEvent> = {
            let mut tables = self.tables()?;
            let now = Utc::now();
            events
                .into_iter()
                .map(|event| Self::materialize(&mut tables, event, now))
                .collect()
        };
        for row in &rows {
            self.publish(ChangeOperation::Insert, row.clone());
        }
        Ok(rows)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<MonitoringEvent>, StoreError> {
        self.check_reachable()?;
        let mut rows: Vec<MonitoringEvent> = self
            .tables()?
            .events
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        if !filter.ascending {
            rows.reverse();
        }
        if let Some(limit) = filter.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(rows)
    }

    async fn update_event(&self, event_id: i64, patch: EventPatch) -> Result<(), StoreError> {
        self.check_fault(&self.faults.event_writes, "monitoring_events")?;
        let row = {
            let mut tables = self.tables()?;
            let row = tables
                .events
                .get_mut(&event_id)
                .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))?;
            if let Some(status) = patch.status {
                row.status = status;
            }
            if let Some(comment) = patch.comment {
                row.comment = Some(comment);
            }
            row.clone()
        };
        self.publish(ChangeOperation::Update, row);
        Ok(())
    }

    async fn delete_event(&self, event_id: i64) -> Result<(), StoreError> {
        self.check_fault(&self.faults.event_writes, "monitoring_events")?;
        let removed = self.tables()?.events.remove(&event_id);
        match removed {
            Some(row) => {
                self.publish(ChangeOperation::Delete, row);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("event {event_id}"))),
        }
    }

    async fn failure_count(&self, post_id: i64) -> Result<Option<i64>, StoreError> {
        self.check_reachable()?;
        Ok(self.tables()?.failures.get(&post_id).copied())
    }

    async fn list_failure_counts(&self) -> Result<Vec<FailureCount>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .tables()?
            .failures
            .iter()
            .map(|(post_id, count)| FailureCount {
                post_id: *post_id,
                count: *count,
            })
            .collect())
    }

    async fn upsert_failure_count(&self, post_id: i64, count: i64) -> Result<(), StoreError> {
        self.check_fault(&self.faults.counter_writes, "post_failures")?;
        if count < 0 {
            return Err(StoreError::Database(format!(
                "post_failures.count must be non-negative, got {count}"
            )));
        }
        self.tables()?.failures.insert(post_id, count);
        Ok(())
    }

    async fn list_compliance_configs(&self) -> Result<Vec<ComplianceConfig>, StoreError> {
        self.check_reachable()?;
        Ok(self.tables()?.configs.values().cloned().collect())
    }

    async fn upsert_compliance_config(&self, config: &ComplianceConfig) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.tables()?.configs.insert(config.post_id, config.clone());
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventFeed, StoreError> {
        self.check_reachable()?;
        Ok(self.feed_tx.subscribe())
    }
}

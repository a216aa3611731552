use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::models::{
    format_time_of_day, parse_time_of_day, Company, ComplianceConfig, EventPatch, FailureCount,
    MonitoringEvent, NewEvent, Post,
};
use super::store::{EventChange, EventFeed, EventFilter, FeedMessage, MonitoringStore, StoreError};

/// Channel the `monitoring_events_feed` trigger notifies on.
pub const EVENT_FEED_CHANNEL: &str = "monitoring_events";

const MAX_FEED_RECONNECT_DELAY_SECONDS: u64 = 60;
const DEFAULT_FEED_RECONNECT_DELAY_SECONDS: u64 = 1;

#[derive(Debug, FromRow)]
struct PostRow {
    id: i64,
    company_id: i64,
    name: String,
    location: String,
    blocked: bool,
    password: String,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            company_id: row.company_id,
            name: row.name,
            location: row.location,
            blocked: row.blocked,
            access_secret: row.password,
            last_heartbeat: row.last_heartbeat,
        }
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    post_id: i64,
    #[sqlx(rename = "type")]
    kind: String,
    timestamp: DateTime<Utc>,
    status: String,
    comment: Option<String>,
}

impl TryFrom<EventRow> for MonitoringEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(MonitoringEvent {
            id: row.id,
            post_id: row.post_id,
            kind: row.kind.parse().map_err(StoreError::InvalidRow)?,
            timestamp: row.timestamp,
            status: row.status.parse().map_err(StoreError::InvalidRow)?,
            comment: row.comment,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    post_id: i64,
    activation_time: String,
    deactivation_time: String,
    progress_duration_minutes: i32,
    alert_sound_seconds: i32,
}

impl TryFrom<ConfigRow> for ComplianceConfig {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(ComplianceConfig {
            post_id: row.post_id,
            activation_time: parse_time_of_day(&row.activation_time)
                .map_err(StoreError::InvalidRow)?,
            deactivation_time: parse_time_of_day(&row.deactivation_time)
                .map_err(StoreError::InvalidRow)?,
            progress_duration_minutes: row.progress_duration_minutes,
            alert_sound_seconds: row.alert_sound_seconds,
        })
    }
}

const EVENT_COLUMNS: &str = r#"id, post_id, "type", "timestamp", status, comment"#;
const POST_COLUMNS: &str = "id, company_id, name, location, blocked, password, last_heartbeat";

/// PostgreSQL-backed store. The change-feed rides on `LISTEN`/`NOTIFY`.
pub struct PgStore {
    pool: PgPool,
    feed_tx: broadcast::Sender<FeedMessage>,
    listener_started: Arc<AtomicBool>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let (feed_tx, _) = broadcast::channel(1024);
        Self {
            pool,
            feed_tx,
            listener_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Applies the bundled schema and change-feed trigger.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::SchemaMissing(format!("Migration failed: {e}")))
    }

    fn spawn_feed_listener(&self) {
        let pool = self.pool.clone();
        let feed_tx = self.feed_tx.clone();
        let started = Arc::clone(&self.listener_started);
        tokio::spawn(async move {
            let mut reconnect_delay_seconds = DEFAULT_FEED_RECONNECT_DELAY_SECONDS;
            loop {
                match listen_once(&pool, &feed_tx).await {
                    Ok(()) => {
                        info!("Event feed listener stopped: no subscribers left.");
                        started.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        let jitter_ms = rand::rng().random_range(0..500);
                        warn!(
                            error = %e,
                            delay_seconds = reconnect_delay_seconds,
                            "Event feed connection lost. Reconnecting."
                        );
                        tokio::time::sleep(
                            Duration::from_secs(reconnect_delay_seconds)
                                + Duration::from_millis(jitter_ms),
                        )
                        .await;
                        reconnect_delay_seconds =
                            (reconnect_delay_seconds * 2).min(MAX_FEED_RECONNECT_DELAY_SECONDS);
                    }
                }
            }
        });
    }
}

/// Forwards notifications until the broadcast has no receivers (`Ok`) or the
/// connection cannot be re-established (`Err`). A gap is announced once
/// `LISTEN` is active and after every dropped connection, since
/// notifications sent while not listening are never delivered.
async fn listen_once(
    pool: &PgPool,
    feed_tx: &broadcast::Sender<FeedMessage>,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(EVENT_FEED_CHANNEL).await?;
    info!(channel = EVENT_FEED_CHANNEL, "Listening for event changes.");
    if feed_tx.send(FeedMessage::Gap).is_err() {
        return Ok(());
    }

    loop {
        let Some(notification) = listener.try_recv().await? else {
            warn!("Event feed connection dropped. Changes may have been missed.");
            if feed_tx.send(FeedMessage::Gap).is_err() {
                return Ok(());
            }
            continue;
        };
        match serde_json::from_str::<EventChange>(notification.payload()) {
            Ok(change) => {
                debug!(operation = ?change.operation, event_id = change.row.id, "Event change received.");
                if feed_tx.send(FeedMessage::Change(change)).is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                error!(error = %e, payload = notification.payload(), "Malformed event change payload.");
            }
        }
    }
}

#[async_trait]
impl MonitoringStore for PgStore {
    async fn find_company_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Company>, StoreError> {
        let company = sqlx::query_as::<_, (i64, String, String, String, bool)>(
            "SELECT id, name, username, password, blocked FROM companies WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .map(|(id, name, username, password, blocked)| Company {
            id,
            name,
            username,
            password,
            blocked,
        });
        Ok(company)
    }

    async fn list_posts(&self) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM service_posts ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Post::from).collect())
    }

    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM service_posts WHERE id = $1"
        ))
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Post::from))
    }

    async fn find_post_by_credentials(
        &self,
        post_id: i64,
        access_secret: &str,
    ) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM service_posts WHERE id = $1 AND password = $2"
        ))
        .bind(post_id)
        .bind(access_secret)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Post::from))
    }

    async fn set_heartbeat(
        &self,
        post_id: i64,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE service_posts SET last_heartbeat = $1 WHERE id = $2")
            .bind(at)
            .bind(post_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("post {post_id}")));
        }
        Ok(())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<MonitoringEvent, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"INSERT INTO monitoring_events (post_id, "type", "timestamp", status)
               VALUES ($1, $2, COALESCE($3, NOW()), $4)
               RETURNING {EVENT_COLUMNS}"#
        ))
        .bind(event.post_id)
        .bind(event.kind.as_str())
        .bind(event.timestamp)
        .bind(event.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn insert_events(
        &self,
        events: Vec<NewEvent>,
    ) -> Result<Vec<MonitoringEvent>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(events.len());
        for event in events {
            let row = sqlx::query_as::<_, EventRow>(&format!(
                r#"INSERT INTO monitoring_events (post_id, "type", "timestamp", status)
                   VALUES ($1, $2, COALESCE($3, NOW()), $4)
                   RETURNING {EVENT_COLUMNS}"#
            ))
            .bind(event.post_id)
            .bind(event.kind.as_str())
            .bind(event.timestamp)
            .bind(event.status.as_str())
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(row);
        }
        tx.commit().await?;
        inserted.into_iter().map(MonitoringEvent::try_from).collect()
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<MonitoringEvent>, StoreError> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {EVENT_COLUMNS} FROM monitoring_events WHERE TRUE"
        ));
        if let Some(post_id) = filter.post_id {
            query.push(" AND post_id = ").push_bind(post_id);
        }
        if let Some(kind) = filter.kind {
            query.push(r#" AND "type" = "#).push_bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            query.push(r#" AND "timestamp" >= "#).push_bind(since);
        }
        if let Some(needle) = &filter.comment_contains {
            query
                .push(" AND comment ILIKE '%' || ")
                .push_bind(needle.clone())
                .push(" || '%'");
        }
        query.push(if filter.ascending {
            r#" ORDER BY "timestamp" ASC, id ASC"#
        } else {
            r#" ORDER BY "timestamp" DESC, id DESC"#
        });
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows = query
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MonitoringEvent::try_from).collect()
    }

    async fn update_event(&self, event_id: i64, patch: EventPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE monitoring_events SET status = COALESCE($1, status), comment = COALESCE($2, comment) WHERE id = $3",
        )
        .bind(patch.status.map(|status| status.as_str()))
        .bind(patch.comment)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    async fn delete_event(&self, event_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM monitoring_events WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    async fn failure_count(&self, post_id: i64) -> Result<Option<i64>, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count FROM post_failures WHERE post_id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_failure_counts(&self) -> Result<Vec<FailureCount>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64)>("SELECT post_id, count FROM post_failures")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(post_id, count)| FailureCount { post_id, count })
            .collect())
    }

    async fn upsert_failure_count(&self, post_id: i64, count: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO post_failures (post_id, count) VALUES ($1, $2)
            ON CONFLICT (post_id) DO UPDATE SET count = EXCLUDED.count
            "#,
        )
        .bind(post_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_compliance_configs(&self) -> Result<Vec<ComplianceConfig>, StoreError> {
        let rows = sqlx::query_as::<_, ConfigRow>(
            "SELECT post_id, activation_time, deactivation_time, progress_duration_minutes, alert_sound_seconds FROM alerta_vigia_configs",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ComplianceConfig::try_from).collect()
    }

    async fn upsert_compliance_config(&self, config: &ComplianceConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alerta_vigia_configs
                (post_id, activation_time, deactivation_time, progress_duration_minutes, alert_sound_seconds)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (post_id) DO UPDATE SET
                activation_time = EXCLUDED.activation_time,
                deactivation_time = EXCLUDED.deactivation_time,
                progress_duration_minutes = EXCLUDED.progress_duration_minutes,
                alert_sound_seconds = EXCLUDED.alert_sound_seconds
            "#,
        )
        .bind(config.post_id)
        .bind(format_time_of_day(&config.activation_time))
        .bind(format_time_of_day(&config.deactivation_time))
        .bind(config.progress_duration_minutes)
        .bind(config.alert_sound_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventFeed, StoreError> {
        let receiver = self.feed_tx.subscribe();
        if self
            .listener_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_feed_listener();
        }
        Ok(receiver)
    }
}

use chrono::{DateTime, SubsecRound, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connectivity::Connectivity;
use super::emitter::{EmitError, Emission, Emitter};
use crate::db::{EventKind, MonitoringStore, Post, StoreError};
use crate::tasks::{Shutdown, TaskHandle};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid post id or access secret.")]
    InvalidCredentials,
    #[error("This service post is blocked.")]
    PostBlocked,
    #[error("This post is already being monitored on another device.")]
    AlreadyMonitored,
    #[error("Could not verify the post: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactiveReason {
    Exited,
    /// Another device wrote the heartbeat; this session stopped writing.
    TakenOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Inactive(InactiveReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub takeover_threshold: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            takeover_threshold: Duration::from_secs(45),
        }
    }
}

/// Rejects a session start while the stored heartbeat is younger than the
/// threshold.
pub fn arbitrate(
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Result<(), SessionError> {
    let Some(last) = last_heartbeat else {
        return Ok(());
    };
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    if now.signed_duration_since(last) < threshold {
        return Err(SessionError::AlreadyMonitored);
    }
    Ok(())
}

// Timestamps are stored with microsecond precision; comparing against what
// we wrote only works if we write that precision too.
fn heartbeat_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Default, Clone, Copy)]
struct OwnWrites {
    attempted: Option<DateTime<Utc>>,
    written: Option<DateTime<Utc>>,
}

/// The heartbeats this client wrote. A stored value that is neither the
/// last attempted nor the last confirmed write, or a cleared heartbeat,
/// belongs to someone else. Device clocks are never compared.
#[derive(Debug, Default)]
struct OwnHeartbeat(Mutex<OwnWrites>);

impl OwnHeartbeat {
    fn writes(&self) -> std::sync::MutexGuard<'_, OwnWrites> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn attempt(&self, at: DateTime<Utc>) {
        self.writes().attempted = Some(at);
    }

    fn written(&self, at: DateTime<Utc>) {
        self.writes().written = Some(at);
    }

    fn is_foreign(&self, stored: Option<DateTime<Utc>>) -> bool {
        let own = *self.writes();
        match stored {
            None => true,
            Some(_) if own.attempted.is_none() && own.written.is_none() => false,
            Some(stored) => own.attempted != Some(stored) && own.written != Some(stored),
        }
    }
}

/// Starts guard sessions on posts.
#[derive(Clone)]
pub struct HeartbeatController {
    store: Arc<dyn MonitoringStore>,
    emitter: Emitter,
    settings: HeartbeatSettings,
    active_post: Arc<watch::Sender<Option<i64>>>,
}

impl HeartbeatController {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        emitter: Emitter,
        settings: HeartbeatSettings,
    ) -> Self {
        let (active_post, _) = watch::channel(None);
        Self {
            store,
            emitter,
            settings,
            active_post: Arc::new(active_post),
        }
    }

    /// The post this client is currently guarding, if any.
    pub fn active_post(&self) -> Option<i64> {
        *self.active_post.borrow()
    }

    pub fn watch_active_post(&self) -> watch::Receiver<Option<i64>> {
        self.active_post.subscribe()
    }

    pub async fn start(&self, post_id: i64, access_secret: &str) -> Result<ActiveSession, SessionError> {
        let post = self
            .store
            .find_post_by_credentials(post_id, access_secret.trim())
            .await?
            .ok_or(SessionError::InvalidCredentials)?;
        if post.blocked {
            return Err(SessionError::PostBlocked);
        }
        arbitrate(post.last_heartbeat, Utc::now(), self.settings.takeover_threshold)?;

        let own = Arc::new(OwnHeartbeat::default());
        let first = heartbeat_now();
        own.attempt(first);
        self.store.set_heartbeat(post.id, Some(first)).await?;
        own.written(first);

        // A rejected event is already reported by the emitter; the session
        // still starts.
        if let Err(e) = self.emitter.emit(post.id, EventKind::GatehouseOnline).await {
            debug!(post_id = post.id, error = %e, "Session started without an online event.");
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Active);
        let state_tx = Arc::new(state_tx);
        self.active_post.send_replace(Some(post.id));
        info!(post_id = post.id, post = %post.name, "Guard session started.");

        let heartbeat = {
            let store = Arc::clone(&self.store);
            let own = Arc::clone(&own);
            let state_tx = Arc::clone(&state_tx);
            let active_post = Arc::clone(&self.active_post);
            let interval = self.settings.interval;
            let post_id = post.id;
            TaskHandle::spawn("heartbeat", move |shutdown| {
                heartbeat_loop(store, post_id, interval, own, state_tx, active_post, shutdown)
            })
        };

        Ok(ActiveSession {
            post,
            store: Arc::clone(&self.store),
            emitter: self.emitter.clone(),
            own,
            state_tx,
            state_rx,
            active_post: Arc::clone(&self.active_post),
            heartbeat: Some(heartbeat),
            finished: false,
        })
    }
}

async fn heartbeat_loop(
    store: Arc<dyn MonitoringStore>,
    post_id: i64,
    period: Duration,
    own: Arc<OwnHeartbeat>,
    state_tx: Arc<watch::Sender<SessionState>>,
    active_post: Arc<watch::Sender<Option<i64>>>,
    mut shutdown: Shutdown,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.triggered() => break,
        }

        match store.find_post(post_id).await {
            Ok(Some(post)) if own.is_foreign(post.last_heartbeat) => {
                warn!(post_id, "Heartbeat taken over by another device. Stopping session.");
                state_tx.send_replace(SessionState::Inactive(InactiveReason::TakenOver));
                active_post.send_if_modified(|active| {
                    if *active == Some(post_id) {
                        *active = None;
                        true
                    } else {
                        false
                    }
                });
                break;
            }
            Ok(_) => {}
            Err(e) => debug!(post_id, error = %e, "Could not read heartbeat before writing."),
        }

        let at = heartbeat_now();
        own.attempt(at);
        match store.set_heartbeat(post_id, Some(at)).await {
            Ok(()) => {
                own.written(at);
                debug!(post_id, "Heartbeat written.");
            }
            Err(e) => error!(post_id, error = %e, "Heartbeat failed. Retrying next tick."),
        }
    }
}

/// A running guard session. Call [`ActiveSession::exit`] to end it; dropping
/// it instead sends a best-effort "gatehouse offline" event.
pub struct ActiveSession {
    post: Post,
    store: Arc<dyn MonitoringStore>,
    emitter: Emitter,
    own: Arc<OwnHeartbeat>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    active_post: Arc<watch::Sender<Option<i64>>>,
    heartbeat: Option<TaskHandle>,
    finished: bool,
}

impl ActiveSession {
    pub fn post(&self) -> &Post {
        &self.post
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    fn is_taken_over(&self) -> bool {
        self.state() == SessionState::Inactive(InactiveReason::TakenOver)
    }

    /// Manual heartbeat after the guard answered a presence prompt. Skipped
    /// while offline; returns whether a write happened.
    pub async fn confirm_presence(&self) -> Result<bool, StoreError> {
        self.presence_confirmer().confirm().await
    }

    pub fn presence_confirmer(&self) -> PresenceConfirmer {
        PresenceConfirmer {
            post_id: self.post.id,
            store: Arc::clone(&self.store),
            connectivity: self.emitter.connectivity().clone(),
            own: Arc::clone(&self.own),
            state_rx: self.state_rx.clone(),
        }
    }

    pub async fn panic(&self) -> Result<Emission, EmitError> {
        warn!(post_id = self.post.id, "Panic button pressed.");
        self.emitter.emit(self.post.id, EventKind::PanicButton).await
    }

    pub async fn system_event(&self, kind: EventKind) -> Result<Emission, EmitError> {
        self.emitter.emit(self.post.id, kind).await
    }

    /// Stops the heartbeat, records "gatehouse offline" and clears the
    /// stored heartbeat. After a takeover the post belongs to the other
    /// device, so neither write happens.
    pub async fn exit(mut self) {
        self.finished = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }

        if !self.is_taken_over() {
            if let Err(e) = self.emitter.emit(self.post.id, EventKind::GatehouseOffline).await {
                warn!(post_id = self.post.id, error = %e, "Exit event not recorded.");
            }
            if let Err(e) = self.store.set_heartbeat(self.post.id, None).await {
                error!(post_id = self.post.id, error = %e, "Failed to clear heartbeat on exit.");
            }
            self.state_tx
                .send_replace(SessionState::Inactive(InactiveReason::Exited));
        }
        self.release_active_post();
        info!(post_id = self.post.id, "Guard session ended.");
    }

    fn release_active_post(&self) {
        let post_id = self.post.id;
        self.active_post.send_if_modified(|active| {
            if *active == Some(post_id) {
                *active = None;
                true
            } else {
                false
            }
        });
    }
}

/// Writes manual heartbeats for a session without owning it.
#[derive(Clone)]
pub struct PresenceConfirmer {
    post_id: i64,
    store: Arc<dyn MonitoringStore>,
    connectivity: Connectivity,
    own: Arc<OwnHeartbeat>,
    state_rx: watch::Receiver<SessionState>,
}

impl PresenceConfirmer {
    pub fn post_id(&self) -> i64 {
        self.post_id
    }

    pub async fn confirm(&self) -> Result<bool, StoreError> {
        let active = *self.state_rx.borrow() == SessionState::Active;
        if !active || !self.connectivity.is_online() {
            return Ok(false);
        }
        let at = heartbeat_now();
        self.own.attempt(at);
        self.store.set_heartbeat(self.post_id, Some(at)).await?;
        self.own.written(at);
        debug!(post_id = self.post_id, "Presence confirmed.");
        Ok(true)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.is_taken_over() {
            self.emitter
                .emit_detached(self.post.id, EventKind::GatehouseOffline);
        }
        self.release_active_post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::local_storage::LocalStorage;
    use crate::monitoring::offline_queue::OfflineQueue;
    use crate::notifications::NoticeBroadcaster;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        connectivity: Connectivity,
        controller: HeartbeatController,
    }

    fn post(id: i64, last_heartbeat: Option<DateTime<Utc>>) -> Post {
        Post {
            id,
            company_id: 1,
            name: format!("Portaria {id}"),
            location: "Rua A".into(),
            blocked: false,
            access_secret: "s3cret".into(),
            last_heartbeat,
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let connectivity = Connectivity::new(true);
        let emitter = Emitter::new(
            store.clone(),
            connectivity.clone(),
            Arc::new(OfflineQueue::open(LocalStorage::open(dir.path()).unwrap())),
            NoticeBroadcaster::default(),
        );
        let controller = HeartbeatController::new(store.clone(), emitter, HeartbeatSettings::default());
        Fixture {
            _dir: dir,
            store,
            connectivity,
            controller,
        }
    }

    fn kinds(store: &MemoryStore) -> Vec<EventKind> {
        store.stored_events().into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_arbitration_boundary() {
        let now = Utc::now();
        let threshold = Duration::from_secs(45);
        assert_eq!(
            arbitrate(Some(now - chrono::Duration::seconds(44)), now, threshold),
            Err(SessionError::AlreadyMonitored)
        );
        assert_eq!(arbitrate(Some(now - chrono::Duration::seconds(45)), now, threshold), Ok(()));
        assert_eq!(arbitrate(None, now, threshold), Ok(()));
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let fx = fixture();
        fx.store.add_post(post(1, Some(Utc::now() - chrono::Duration::seconds(10))));
        fx.store.add_post(Post {
            blocked: true,
            ..post(2, None)
        });

        assert_eq!(
            fx.controller.start(1, "wrong").await.err(),
            Some(SessionError::InvalidCredentials)
        );
        assert_eq!(fx.controller.start(99, "s3cret").await.err(), Some(SessionError::InvalidCredentials));
        assert_eq!(fx.controller.start(2, "s3cret").await.err(), Some(SessionError::PostBlocked));
        assert_eq!(fx.controller.start(1, "s3cret").await.err(), Some(SessionError::AlreadyMonitored));
        assert!(fx.store.stored_events().is_empty());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_accepted_and_exit_cleans_up() {
        let fx = fixture();
        fx.store.add_post(post(1, Some(Utc::now() - chrono::Duration::seconds(45))));

        let session = fx.controller.start(1, " s3cret ").await.unwrap();
        assert_eq!(fx.controller.active_post(), Some(1));
        assert!(fx.store.stored_post(1).unwrap().last_heartbeat.is_some());
        assert_eq!(kinds(&fx.store), vec![EventKind::GatehouseOnline]);

        session.exit().await;
        assert_eq!(fx.controller.active_post(), None);
        assert!(fx.store.stored_post(1).unwrap().last_heartbeat.is_none());
        assert_eq!(
            kinds(&fx.store),
            vec![EventKind::GatehouseOnline, EventKind::GatehouseOffline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_refreshed_every_interval() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let session = fx.controller.start(1, "s3cret").await.unwrap();
        let first = fx.store.stored_post(1).unwrap().last_heartbeat.unwrap();

        // Wall clock does not advance with paused time, so wait for a real
        // microsecond before the tick compares timestamps.
        std::thread::sleep(Duration::from_millis(2));
        tokio::time::sleep(Duration::from_secs(31)).await;
        let second = fx.store.stored_post(1).unwrap().last_heartbeat.unwrap();
        assert!(second > first);
        assert_eq!(session.state(), SessionState::Active);

        session.exit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_heartbeat_ends_session() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let session = fx.controller.start(1, "s3cret").await.unwrap();

        fx.store
            .set_heartbeat(1, Some(Utc::now() + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(session.state(), SessionState::Inactive(InactiveReason::TakenOver));
        assert_eq!(fx.controller.active_post(), None);

        session.exit().await;
        assert!(fx.store.stored_post(1).unwrap().last_heartbeat.is_some());
        assert_eq!(kinds(&fx.store), vec![EventKind::GatehouseOnline]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_by_device_with_slower_clock_ends_session() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let session = fx.controller.start(1, "s3cret").await.unwrap();

        fx.store
            .set_heartbeat(1, Some(Utc::now() - chrono::Duration::seconds(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(session.state(), SessionState::Inactive(InactiveReason::TakenOver));
        assert_eq!(fx.controller.active_post(), None);
        session.exit().await;
    }

    #[tokio::test]
    async fn test_failed_first_heartbeat_refuses_session() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        fx.store.fail_heartbeat_writes(true);

        let result = fx.controller.start(1, "s3cret").await;
        assert!(matches!(result, Err(SessionError::Store(_))));
        assert_eq!(fx.controller.active_post(), None);
        assert!(fx.store.stored_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_periodic_heartbeat_is_retried_next_tick() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let session = fx.controller.start(1, "s3cret").await.unwrap();
        let first = fx.store.stored_post(1).unwrap().last_heartbeat.unwrap();

        fx.store.fail_heartbeat_writes(true);
        std::thread::sleep(Duration::from_millis(2));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fx.store.stored_post(1).unwrap().last_heartbeat, Some(first));
        assert_eq!(session.state(), SessionState::Active);

        fx.store.fail_heartbeat_writes(false);
        std::thread::sleep(Duration::from_millis(2));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.store.stored_post(1).unwrap().last_heartbeat.unwrap() > first);
        assert_eq!(session.state(), SessionState::Active);

        session.exit().await;
    }

    #[tokio::test]
    async fn test_presence_confirmation_only_online() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let session = fx.controller.start(1, "s3cret").await.unwrap();

        assert!(session.confirm_presence().await.unwrap());
        fx.connectivity.set_online(false);
        assert!(!session.confirm_presence().await.unwrap());

        session.exit().await;
    }

    #[tokio::test]
    async fn test_drop_sends_best_effort_offline_event() {
        let fx = fixture();
        fx.store.add_post(post(1, None));
        let mut feed = fx.store.subscribe_events().await.unwrap();
        let session = fx.controller.start(1, "s3cret").await.unwrap();
        assert_eq!(feed.recv().await.unwrap().into_change().unwrap().row.kind, EventKind::GatehouseOnline);

        drop(session);
        assert_eq!(feed.recv().await.unwrap().into_change().unwrap().row.kind, EventKind::GatehouseOffline);
        assert_eq!(fx.controller.active_post(), None);
    }
}

//! The monitor facade: owns the shared state and wires the components
//! together for the binary.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::alerting::{self, ComplianceConfigs, ComplianceScheduler};
use crate::config::MonitorConfig;
use crate::db::{
    ComplianceConfig, EventFilter, EventPatch, EventStatus, FailureCount, MonitoringStore, Post,
    StoreError,
};
use crate::error::MonitorError;
use crate::local_storage::LocalStorage;
use crate::monitoring::offline_queue::sync_watcher;
use crate::monitoring::{
    ActiveSession, Connectivity, Emitter, FailureCounter, FailureTallies, HeartbeatController,
    HeartbeatSettings, OfflineQueue, PresenceCycle, PresenceSettings, ReachabilityProbe,
    SessionError,
};
use crate::notifications::{Notice, NoticeBroadcaster};
use crate::realtime::timeline::UNKNOWN_POST_NAME;
use crate::realtime::{AlertTone, HiddenEvents, Reconciler, Timeline, TimelineEvent};
use crate::tasks::TaskHandle;
use crate::viewer::{self, Viewer, ViewerSnapshot};

/// Everything fetched from the store at start-up.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    pub posts: Vec<Post>,
    /// Newest first.
    pub events: Vec<TimelineEvent>,
    pub failure_counts: Vec<FailureCount>,
    pub configs: HashMap<i64, ComplianceConfig>,
}

impl MonitorState {
    pub async fn load(store: &dyn MonitoringStore) -> Result<Self, MonitorError> {
        let posts = store.list_posts().await.map_err(MonitorError::from_load)?;
        let rows = store
            .list_events(&EventFilter::default())
            .await
            .map_err(MonitorError::from_load)?;
        let failure_counts = store
            .list_failure_counts()
            .await
            .map_err(MonitorError::from_load)?;
        let configs = store
            .list_compliance_configs()
            .await
            .map_err(MonitorError::from_load)?
            .into_iter()
            .map(|config| (config.post_id, config))
            .collect();

        let names: HashMap<i64, &str> = posts.iter().map(|post| (post.id, post.name.as_str())).collect();
        let events = rows
            .into_iter()
            .map(|event| TimelineEvent {
                post_name: names
                    .get(&event.post_id)
                    .copied()
                    .unwrap_or(UNKNOWN_POST_NAME)
                    .to_string(),
                event,
            })
            .collect();

        Ok(Self {
            posts,
            events,
            failure_counts,
            configs,
        })
    }
}

pub struct Monitor {
    config: MonitorConfig,
    store: Arc<dyn MonitoringStore>,
    connectivity: Connectivity,
    notices: NoticeBroadcaster,
    queue: Arc<OfflineQueue>,
    emitter: Emitter,
    counter: Arc<FailureCounter>,
    heartbeat: HeartbeatController,
    timeline: Arc<Timeline>,
    hidden: HiddenEvents,
    viewer_tx: watch::Sender<ViewerSnapshot>,
    configs: ComplianceConfigs,
}

impl Monitor {
    /// Opens local storage under the configured data directory. Starts online;
    /// the reachability probe corrects that if a probe URL is configured.
    pub fn new(store: Arc<dyn MonitoringStore>, config: MonitorConfig) -> Result<Self, MonitorError> {
        let storage = LocalStorage::open(config.data_dir.clone())?;
        let connectivity = Connectivity::new(true);
        let notices = NoticeBroadcaster::default();
        let queue = Arc::new(OfflineQueue::open(storage.clone()));
        let emitter = Emitter::new(
            Arc::clone(&store),
            connectivity.clone(),
            Arc::clone(&queue),
            notices.clone(),
        );
        let counter = Arc::new(FailureCounter::new(
            Arc::clone(&store),
            emitter.clone(),
            Arc::new(FailureTallies::default()),
            notices.clone(),
        ));
        let heartbeat = HeartbeatController::new(
            Arc::clone(&store),
            emitter.clone(),
            HeartbeatSettings {
                interval: config.heartbeat_interval(),
                takeover_threshold: config.takeover_threshold(),
            },
        );
        let (viewer_tx, _) = watch::channel(ViewerSnapshot::default());

        Ok(Self {
            config,
            store,
            connectivity,
            notices,
            queue,
            emitter,
            counter,
            heartbeat,
            timeline: Arc::new(Timeline::default()),
            hidden: HiddenEvents::open(storage),
            viewer_tx,
            configs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn store(&self) -> &Arc<dyn MonitoringStore> {
        &self.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn subscribe_notices(&self) -> tokio::sync::broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn viewer(&self) -> ViewerSnapshot {
        self.viewer_tx.borrow().clone()
    }

    /// Fetches posts, events, counters and compliance windows and installs
    /// them as the in-memory state.
    pub async fn load(&self) -> Result<(), MonitorError> {
        let state = MonitorState::load(self.store.as_ref()).await?;
        info!(
            posts = state.posts.len(),
            events = state.events.len(),
            configs = state.configs.len(),
            "Monitoring state loaded."
        );
        self.timeline.replace_all(state.events).await;
        self.counter.tallies().seed(state.failure_counts);
        *self.configs.write().await = state.configs;
        let posts = state.posts;
        self.viewer_tx.send_modify(|snapshot| snapshot.posts = posts);
        Ok(())
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<Viewer, MonitorError> {
        let viewer = viewer::login(self.store.as_ref(), username, password).await?;
        let signed_in = viewer.clone();
        self.viewer_tx
            .send_modify(|snapshot| snapshot.viewer = Some(signed_in));
        Ok(viewer)
    }

    pub fn sign_out(&self) {
        self.viewer_tx.send_modify(|snapshot| snapshot.viewer = None);
    }

    pub async fn start_session(&self, post_id: i64, access_secret: &str) -> Result<ActiveSession, SessionError> {
        self.heartbeat.start(post_id, access_secret).await
    }

    /// Starts presence prompts for a session, paced by the post's compliance
    /// window settings (or the defaults when it has none).
    pub async fn start_presence(&self, session: &ActiveSession) -> PresenceCycle {
        let post_id = session.post().id;
        let config = self
            .configs
            .read()
            .await
            .get(&post_id)
            .cloned()
            .unwrap_or_else(|| ComplianceConfig::default_for(post_id));
        PresenceCycle::spawn(
            session.presence_confirmer(),
            Arc::clone(&self.counter),
            PresenceSettings::from(&config),
        )
    }

    /// Subscribes to the change-feed, then reloads the timeline so events
    /// committed since `load` are not lost. Changes that arrive during the
    /// reload are applied afterwards and deduplicated by id.
    pub async fn spawn_reconciler(&self, tone: Arc<dyn AlertTone>) -> Result<TaskHandle, MonitorError> {
        let feed = self.store.subscribe_events().await?;
        let reconciler = Reconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.timeline),
            self.viewer_tx.subscribe(),
            tone,
        );
        reconciler.resync().await?;
        Ok(TaskHandle::spawn("reconciler", move |shutdown| {
            reconciler.run(feed, shutdown)
        }))
    }

    pub fn spawn_compliance(&self) -> TaskHandle {
        let scheduler = ComplianceScheduler::new(
            self.emitter.clone(),
            Arc::clone(&self.timeline),
            Arc::clone(&self.configs),
            self.viewer_tx.subscribe(),
            self.heartbeat.watch_active_post(),
            self.config.grace_minutes(),
        );
        let period = Duration::from_secs(self.config.compliance.tick_seconds);
        TaskHandle::spawn("compliance", move |shutdown| scheduler.run(period, shutdown))
    }

    pub fn spawn_offline_sync(&self) -> TaskHandle {
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.store);
        let tallies = Arc::clone(self.counter.tallies());
        let notices = self.notices.clone();
        let connectivity = self.connectivity.clone();
        TaskHandle::spawn("offline-sync", move |shutdown| {
            sync_watcher(queue, store, tallies, notices, connectivity, shutdown)
        })
    }

    /// `None` when no probe URL is configured.
    pub fn spawn_probe(&self) -> Option<TaskHandle> {
        let settings = &self.config.connectivity;
        let url = settings.probe_url.clone()?;
        let probe = match ReachabilityProbe::new(
            url,
            Duration::from_secs(settings.probe_interval_seconds),
            Duration::from_secs(settings.probe_timeout_seconds),
        ) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(error = %e, "Reachability probe disabled.");
                return None;
            }
        };
        let connectivity = self.connectivity.clone();
        Some(TaskHandle::spawn("probe", move |shutdown| {
            probe.run(connectivity, shutdown)
        }))
    }

    pub async fn save_comment(&self, event_id: i64, comment: &str) -> Result<(), StoreError> {
        self.store
            .update_event(
                event_id,
                EventPatch {
                    status: None,
                    comment: Some(comment.to_string()),
                },
            )
            .await?;
        self.timeline.set_comment(event_id, comment).await;
        info!(event_id, "Event comment saved.");
        Ok(())
    }

    /// Flips an event between resolved and unresolved. Returns the new status.
    pub async fn toggle_event_status(&self, event_id: i64) -> Result<EventStatus, StoreError> {
        let current = self
            .timeline
            .get(event_id)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("monitoring_events {event_id}")))?
            .event
            .status;
        let next = current.toggled();
        self.store
            .update_event(
                event_id,
                EventPatch {
                    status: Some(next),
                    comment: None,
                },
            )
            .await?;
        self.timeline.set_status(event_id, next).await;
        info!(event_id, status = %next, "Event status changed.");
        Ok(next)
    }

    pub fn hide_events(&self, event_ids: impl IntoIterator<Item = i64>) {
        self.hidden.hide(event_ids);
    }

    pub fn restore_hidden(&self) {
        self.hidden.restore_all();
    }

    /// The viewer's timeline without hidden events, optionally narrowed to
    /// posts whose name contains `search` (case-insensitive).
    pub async fn visible_timeline(&self, search: Option<&str>) -> Vec<TimelineEvent> {
        let snapshot = self.viewer();
        let hidden = self.hidden.snapshot();
        let needle = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        self.timeline
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| snapshot.authorized_for(entry.event.post_id))
            .filter(|entry| !hidden.contains(&entry.event.id))
            .filter(|entry| match &needle {
                Some(needle) => entry.post_name.to_lowercase().contains(needle),
                None => true,
            })
            .collect()
    }

    pub fn failure_count(&self, post_id: i64) -> i64 {
        self.counter.tallies().get(post_id)
    }

    pub async fn reset_failures(&self, post_id: i64) -> Result<(), StoreError> {
        self.counter.reset(post_id).await
    }

    pub async fn save_compliance_config(&self, config: ComplianceConfig) -> Result<(), StoreError> {
        alerting::save_config(self.store.as_ref(), &self.configs, config).await
    }
}

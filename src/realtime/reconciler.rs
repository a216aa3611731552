use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::timeline::{Timeline, TimelineEvent, UNKNOWN_POST_NAME};
use crate::db::{
    ChangeOperation, EventChange, EventFeed, EventFilter, EventStatus, FeedMessage,
    MonitoringEvent, MonitoringStore, StoreError,
};
use crate::tasks::Shutdown;
use crate::viewer::ViewerSnapshot;

/// Something the operator can hear.
pub trait AlertTone: Send + Sync {
    fn play(&self, event: &TimelineEvent);
}

/// Rings the terminal bell.
pub struct TerminalBell;

impl AlertTone for TerminalBell {
    fn play(&self, event: &TimelineEvent) {
        eprint!("\x07");
        warn!(
            event_id = event.event.id,
            post = %event.post_name,
            kind = %event.event.kind,
            "ALERT"
        );
    }
}

pub struct Silent;

impl AlertTone for Silent {
    fn play(&self, _event: &TimelineEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// The timeline changed.
    pub applied: bool,
    pub sound_alert: bool,
}

/// Whether a freshly inserted event should ring for this viewer.
pub fn should_sound(event: &MonitoringEvent, snapshot: &ViewerSnapshot) -> bool {
    event.kind.is_alert()
        && event.status == EventStatus::Unresolved
        && snapshot.authorized_for(event.post_id)
}

/// Merges change-feed notifications into the timeline.
pub struct Reconciler {
    store: Arc<dyn MonitoringStore>,
    timeline: Arc<Timeline>,
    viewer: watch::Receiver<ViewerSnapshot>,
    tone: Arc<dyn AlertTone>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        timeline: Arc<Timeline>,
        viewer: watch::Receiver<ViewerSnapshot>,
        tone: Arc<dyn AlertTone>,
    ) -> Self {
        Self {
            store,
            timeline,
            viewer,
            tone,
        }
    }

    /// Attaches the post name: from the snapshot, else from the store, else
    /// a placeholder.
    pub async fn enrich(&self, row: MonitoringEvent, snapshot: &ViewerSnapshot) -> TimelineEvent {
        let post_name = match snapshot.post(row.post_id) {
            Some(post) => post.name.clone(),
            None => match self.store.find_post_name(row.post_id).await {
                Ok(Some(name)) => name,
                Ok(None) => UNKNOWN_POST_NAME.to_string(),
                Err(e) => {
                    debug!(post_id = row.post_id, error = %e, "Post name lookup failed.");
                    UNKNOWN_POST_NAME.to_string()
                }
            },
        };
        TimelineEvent {
            event: row,
            post_name,
        }
    }

    pub async fn apply(&self, change: EventChange) -> ReconcileOutcome {
        // Read at dispatch time so a login or post change in between is seen.
        let snapshot = self.viewer.borrow().clone();

        match change.operation {
            ChangeOperation::Insert => {
                let entry = self.enrich(change.row, &snapshot).await;
                let sound_alert = should_sound(&entry.event, &snapshot);
                if sound_alert {
                    self.tone.play(&entry);
                }
                self.timeline.insert_front_dedup(entry).await;
                ReconcileOutcome {
                    applied: true,
                    sound_alert,
                }
            }
            ChangeOperation::Update => ReconcileOutcome {
                applied: self.timeline.apply_update(&change.row).await,
                sound_alert: false,
            },
            ChangeOperation::Delete => ReconcileOutcome {
                applied: self.timeline.remove(change.row.id).await,
                sound_alert: false,
            },
        }
    }

    /// Rebuilds the timeline from the store after notifications were lost.
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let snapshot = self.viewer.borrow().clone();
        let rows = self.store.list_events(&EventFilter::default()).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.enrich(row, &snapshot).await);
        }
        let count = entries.len();
        self.timeline.replace_all(entries).await;
        Ok(count)
    }

    async fn reload(&self) {
        match self.resync().await {
            Ok(count) => debug!(events = count, "Timeline reloaded."),
            Err(e) => warn!(error = %e, "Timeline reload failed."),
        }
    }

    pub async fn run(self, mut feed: EventFeed, mut shutdown: Shutdown) {
        info!("Event reconciler started.");
        loop {
            tokio::select! {
                received = feed.recv() => match received {
                    Ok(FeedMessage::Change(change)) => {
                        let event_id = change.row.id;
                        let outcome = self.apply(change).await;
                        debug!(event_id, applied = outcome.applied, sound = outcome.sound_alert, "Change applied.");
                    }
                    Ok(FeedMessage::Gap) => {
                        info!("Event feed reconnected. Reloading timeline.");
                        self.reload().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event feed lagged. Reloading timeline.");
                        self.reload().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event feed closed.");
                        break;
                    }
                },
                _ = shutdown.triggered() => break,
            }
        }
        info!("Event reconciler stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventKind, MemoryStore, NewEvent, Post};
    use crate::viewer::Viewer;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTone(AtomicUsize);

    impl AlertTone for CountingTone {
        fn play(&self, _event: &TimelineEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn post(id: i64, company_id: i64) -> Post {
        Post {
            id,
            company_id,
            name: format!("Posto {id}"),
            location: String::new(),
            blocked: false,
            access_secret: String::new(),
            last_heartbeat: None,
        }
    }

    fn viewer(company_id: i64, is_admin: bool) -> Viewer {
        Viewer {
            company_id,
            username: if is_admin { "admin".into() } else { "acme".into() },
            company_name: "Acme".into(),
            is_admin,
        }
    }

    fn row(id: i64, post_id: i64, kind: EventKind) -> MonitoringEvent {
        MonitoringEvent {
            id,
            post_id,
            kind,
            timestamp: Utc::now(),
            status: EventStatus::Unresolved,
            comment: None,
        }
    }

    fn insert(row: MonitoringEvent) -> EventChange {
        EventChange {
            operation: ChangeOperation::Insert,
            row,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        timeline: Arc<Timeline>,
        tone: Arc<CountingTone>,
        reconciler: Reconciler,
        _viewer_tx: watch::Sender<ViewerSnapshot>,
    }

    fn fixture(snapshot: ViewerSnapshot) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let timeline = Arc::new(Timeline::default());
        let tone = Arc::new(CountingTone::default());
        let (viewer_tx, viewer_rx) = watch::channel(snapshot);
        let reconciler = Reconciler::new(store.clone(), Arc::clone(&timeline), viewer_rx, tone.clone());
        Fixture {
            store,
            timeline,
            tone,
            reconciler,
            _viewer_tx: viewer_tx,
        }
    }

    #[tokio::test]
    async fn test_optimistic_then_feed_insert_leaves_one_entry() {
        let fx = fixture(ViewerSnapshot::new(Some(viewer(1, true)), vec![post(5, 1)]));
        fx.timeline
            .insert_front_dedup(TimelineEvent {
                event: row(42, 5, EventKind::SystemActivated),
                post_name: "local".into(),
            })
            .await;

        let mut authoritative = row(42, 5, EventKind::SystemActivated);
        authoritative.comment = Some("from feed".into());
        fx.reconciler.apply(insert(authoritative.clone())).await;

        let snapshot = fx.timeline.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].event, authoritative);
        assert_eq!(snapshot[0].post_name, "Posto 5");
    }

    #[tokio::test]
    async fn test_sound_rule() {
        let posts = vec![post(5, 1), post(6, 2)];
        let fx = fixture(ViewerSnapshot::new(Some(viewer(1, false)), posts));

        let own_panic = fx.reconciler.apply(insert(row(1, 5, EventKind::PanicButton))).await;
        assert!(own_panic.sound_alert);
        let foreign_panic = fx.reconciler.apply(insert(row(2, 6, EventKind::PanicButton))).await;
        assert!(!foreign_panic.sound_alert);
        let routine = fx.reconciler.apply(insert(row(3, 5, EventKind::GatehouseOnline))).await;
        assert!(!routine.sound_alert);
        let mut resolved = row(4, 5, EventKind::LocalSemInternet);
        resolved.status = EventStatus::Resolved;
        assert!(!fx.reconciler.apply(insert(resolved)).await.sound_alert);

        assert_eq!(fx.tone.0.load(Ordering::SeqCst), 1);
        assert_eq!(fx.timeline.len().await, 4);
    }

    #[tokio::test]
    async fn test_logged_out_viewer_hears_nothing() {
        let fx = fixture(ViewerSnapshot::new(None, vec![post(5, 1)]));
        let outcome = fx.reconciler.apply(insert(row(1, 5, EventKind::PanicButton))).await;
        assert_eq!(
            outcome,
            ReconcileOutcome {
                applied: true,
                sound_alert: false
            }
        );
    }

    #[tokio::test]
    async fn test_name_enrichment_falls_back() {
        let fx = fixture(ViewerSnapshot::default());
        fx.store.add_post(post(8, 1));

        fx.reconciler.apply(insert(row(1, 8, EventKind::GatehouseOffline))).await;
        fx.reconciler.apply(insert(row(2, 99, EventKind::GatehouseOffline))).await;
        fx.store.set_unreachable(true);
        fx.reconciler.apply(insert(row(3, 8, EventKind::GatehouseOffline))).await;

        let names: Vec<String> = fx.timeline.snapshot().await.into_iter().map(|e| e.post_name).collect();
        assert_eq!(names, vec![UNKNOWN_POST_NAME, UNKNOWN_POST_NAME, "Posto 8"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_of_unknown_ids_are_ignored() {
        let fx = fixture(ViewerSnapshot::default());
        let update = EventChange {
            operation: ChangeOperation::Update,
            row: row(7, 1, EventKind::PanicButton),
        };
        let delete = EventChange {
            operation: ChangeOperation::Delete,
            row: row(7, 1, EventKind::PanicButton),
        };
        assert!(!fx.reconciler.apply(update).await.applied);
        assert!(!fx.reconciler.apply(delete).await.applied);
        assert!(fx.timeline.is_empty().await);
    }

    #[tokio::test]
    async fn test_run_follows_store_feed() {
        let fx = fixture(ViewerSnapshot::new(Some(viewer(1, true)), vec![post(5, 1)]));
        fx.store.add_post(post(5, 1));
        let feed = fx.store.subscribe_events().await.unwrap();
        let timeline = Arc::clone(&fx.timeline);
        let store = Arc::clone(&fx.store);
        let task = crate::tasks::TaskHandle::spawn("reconciler", move |shutdown| {
            fx.reconciler.run(feed, shutdown)
        });

        let inserted = store.insert_event(NewEvent::unresolved(5, EventKind::PanicButton)).await.unwrap();
        store
            .update_event(
                inserted.id,
                crate::db::EventPatch {
                    status: Some(EventStatus::Resolved),
                    comment: None,
                },
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if timeline.get(inserted.id).await.is_some_and(|e| e.event.status == EventStatus::Resolved) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            timeline.get(inserted.id).await.unwrap().event.status,
            EventStatus::Resolved
        );
        task.stop().await;
    }

    #[tokio::test]
    async fn test_feed_gap_reloads_missed_events() {
        let fx = fixture(ViewerSnapshot::new(Some(viewer(1, true)), vec![post(5, 1)]));
        let missed = fx
            .store
            .insert_event(NewEvent::unresolved(5, EventKind::SystemActivated))
            .await
            .unwrap();
        let feed = fx.store.subscribe_events().await.unwrap();
        let timeline = Arc::clone(&fx.timeline);
        let store = Arc::clone(&fx.store);
        let task = crate::tasks::TaskHandle::spawn("reconciler", move |shutdown| {
            fx.reconciler.run(feed, shutdown)
        });

        store.signal_feed_gap();
        for _ in 0..50 {
            if timeline.get(missed.id).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let entry = timeline.get(missed.id).await.unwrap();
        assert_eq!(entry.event.kind, EventKind::SystemActivated);
        assert_eq!(entry.post_name, "Posto 5");
        task.stop().await;
    }
}

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::db::{ComplianceConfig, EventKind, MonitoringEvent, MonitoringStore, StoreError};
use crate::monitoring::{EmitError, Emission, Emitter};
use crate::realtime::Timeline;
use crate::tasks::Shutdown;
use crate::viewer::ViewerSnapshot;

const MINUTES_PER_DAY: u32 = 24 * 60;
const MILLIS_PER_MINUTE: u64 = 60_000;
/// Ticks land here within each minute, as far as possible from either
/// boundary.
const TICK_OFFSET_MILLIS: u64 = 30_000;

pub type ComplianceConfigs = Arc<RwLock<HashMap<i64, ComplianceConfig>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedTransition {
    Activation,
    Deactivation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaisedAlert {
    pub post_id: i64,
    pub transition: MissedTransition,
    pub emission: Result<Emission, EmitError>,
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Minute of day at which a boundary is checked, and whether adding the
/// grace period carried it into the next day.
fn check_minute(boundary: NaiveTime, grace_minutes: u32) -> (u32, bool) {
    let total = minute_of_day(boundary) + grace_minutes;
    (total % MINUTES_PER_DAY, total >= MINUTES_PER_DAY)
}

fn local_instant<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        // Inside a DST gap the wall-clock time does not exist; take the first
        // instant after it.
        .or_else(|| tz.from_local_datetime(&(naive + ChronoDuration::hours(1))).earliest())
        .map(|instant| instant.with_timezone(&Utc))
}

/// Decides whether `now` is the check minute of a boundary the post missed.
///
/// Each boundary is checked on exactly one minute per day:
/// `activation + grace` and `deactivation + grace`, wrapping past midnight.
/// The activation check looks for a "system activated" event at or after
/// that day's activation instant. The deactivation check looks at the
/// post's latest event and flags it if that event still implies the post is
/// staffed. Activation is checked first and wins.
pub fn evaluate_post<Tz: TimeZone>(
    now: &DateTime<Tz>,
    config: &ComplianceConfig,
    events: &[MonitoringEvent],
    grace_minutes: u32,
) -> Option<MissedTransition> {
    let now_minute = now.hour() * 60 + now.minute();

    let (activation_check, wrapped) = check_minute(config.activation_time, grace_minutes);
    if now_minute == activation_check {
        let mut date = now.date_naive();
        if wrapped {
            date = date.pred_opt().unwrap_or(date);
        }
        let has_activated = match local_instant(&now.timezone(), date, config.activation_time) {
            Some(activation) => events.iter().any(|event| {
                event.kind == EventKind::SystemActivated && event.timestamp >= activation
            }),
            None => false,
        };
        if !has_activated {
            return Some(MissedTransition::Activation);
        }
    }

    let (deactivation_check, _) = check_minute(config.deactivation_time, grace_minutes);
    if now_minute == deactivation_check {
        let latest = events.iter().max_by_key(|event| (event.timestamp, event.id));
        if latest.is_some_and(|event| event.kind.implies_on_duty()) {
            return Some(MissedTransition::Deactivation);
        }
    }

    None
}

/// Delay from a wall-clock position within the minute to the next tick
/// offset.
fn delay_to_tick_offset(second: u32, nanosecond: u32) -> Duration {
    // Leap seconds report nanosecond >= 1e9.
    let into_minute =
        u64::from(second.min(59)) * 1000 + u64::from(nanosecond % 1_000_000_000) / 1_000_000;
    Duration::from_millis(
        (TICK_OFFSET_MILLIS + MILLIS_PER_MINUTE - into_minute) % MILLIS_PER_MINUTE,
    )
}

/// Persists a post's compliance window, then updates the shared cache.
pub async fn save_config(
    store: &dyn MonitoringStore,
    configs: &ComplianceConfigs,
    config: ComplianceConfig,
) -> Result<(), StoreError> {
    store.upsert_compliance_config(&config).await?;
    info!(post_id = config.post_id, "Compliance window saved.");
    configs.write().await.insert(config.post_id, config);
    Ok(())
}

/// Per-minute check of every visible post's compliance window.
pub struct ComplianceScheduler {
    emitter: Emitter,
    timeline: Arc<Timeline>,
    configs: ComplianceConfigs,
    viewer: watch::Receiver<ViewerSnapshot>,
    active_post: watch::Receiver<Option<i64>>,
    grace_minutes: u32,
    last_evaluated: Mutex<Option<(NaiveDate, u32)>>,
}

impl ComplianceScheduler {
    pub fn new(
        emitter: Emitter,
        timeline: Arc<Timeline>,
        configs: ComplianceConfigs,
        viewer: watch::Receiver<ViewerSnapshot>,
        active_post: watch::Receiver<Option<i64>>,
        grace_minutes: u32,
    ) -> Self {
        Self {
            emitter,
            timeline,
            configs,
            viewer,
            active_post,
            grace_minutes,
            last_evaluated: Mutex::new(None),
        }
    }

    /// Returns false if this wall-clock minute was already evaluated.
    fn claim_minute(&self, date: NaiveDate, minute: u32) -> bool {
        let mut last = self.last_evaluated.lock().unwrap_or_else(|p| p.into_inner());
        if *last == Some((date, minute)) {
            return false;
        }
        *last = Some((date, minute));
        true
    }

    /// Runs one check at `now`, emitting a missed-transition event for each
    /// post that needs one.
    pub async fn tick<Tz>(&self, now: DateTime<Tz>) -> Vec<RaisedAlert>
    where
        Tz: TimeZone + Send + Sync,
        Tz::Offset: Send + Sync,
    {
        if !self.claim_minute(now.date_naive(), now.hour() * 60 + now.minute()) {
            debug!("Compliance minute already evaluated.");
            return Vec::new();
        }

        let snapshot = self.viewer.borrow().clone();
        let active_post = *self.active_post.borrow();
        let configs = self.configs.read().await.clone();

        let mut raised = Vec::new();
        for post in snapshot.visible_posts() {
            if active_post == Some(post.id) {
                continue;
            }
            let Some(config) = configs.get(&post.id) else {
                continue;
            };
            let events = self.timeline.events_for_post(post.id).await;
            if let Some(transition) = evaluate_post(&now, config, &events, self.grace_minutes) {
                info!(post_id = post.id, post = %post.name, ?transition, "Missed shift transition.");
                let emission = self.emitter.emit(post.id, EventKind::LocalSemInternet).await;
                raised.push(RaisedAlert {
                    post_id: post.id,
                    transition,
                    emission,
                });
            }
        }
        raised
    }

    /// Ticks at the middle of each local wall-clock minute until shut down.
    pub async fn run(self, period: Duration, mut shutdown: Shutdown) {
        let started = Local::now();
        let first = delay_to_tick_offset(started.second(), started.nanosecond());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + first, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_seconds = period.as_secs(), "Compliance scheduler started.");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let raised = self.tick(Local::now()).await;
                    if !raised.is_empty() {
                        info!(count = raised.len(), "Compliance alerts raised.");
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::failure_counter::{CounterOutcome, FailureCounter};
use super::heartbeat::PresenceConfirmer;
use crate::db::ComplianceConfig;
use crate::tasks::{Shutdown, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    /// Quiet time between prompts.
    pub progress: Duration,
    /// How long the guard has to answer while the tone plays.
    pub answer_window: Duration,
}

impl From<&ComplianceConfig> for PresenceSettings {
    fn from(config: &ComplianceConfig) -> Self {
        let minutes = u64::try_from(config.progress_duration_minutes.max(1)).unwrap_or(1);
        let seconds = u64::try_from(config.alert_sound_seconds.max(1)).unwrap_or(1);
        Self {
            progress: Duration::from_secs(minutes * 60),
            answer_window: Duration::from_secs(seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The guard must answer within `answer_window`.
    Prompt { answer_window: Duration },
    Confirmed,
    Missed(CounterOutcome),
}

/// Periodic "are you there" prompts for a guard session. An answered prompt
/// refreshes the heartbeat; an unanswered one counts a vigilant failure.
pub struct PresenceCycle {
    task: TaskHandle,
    confirm_tx: mpsc::Sender<()>,
    pending_rx: watch::Receiver<bool>,
    events_rx: Option<mpsc::Receiver<PresenceEvent>>,
}

impl PresenceCycle {
    pub fn spawn(
        confirmer: PresenceConfirmer,
        counter: Arc<FailureCounter>,
        settings: PresenceSettings,
    ) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (pending_tx, pending_rx) = watch::channel(false);
        let task = TaskHandle::spawn("presence", move |shutdown| {
            presence_loop(confirmer, counter, settings, confirm_rx, pending_tx, events_tx, shutdown)
        });
        Self {
            task,
            confirm_tx,
            pending_rx,
            events_rx: Some(events_rx),
        }
    }

    pub fn is_prompting(&self) -> bool {
        *self.pending_rx.borrow()
    }

    /// Answers the pending prompt. Returns false when no prompt is waiting
    /// for an answer or the cycle has ended.
    pub fn confirm(&self) -> bool {
        if !self.is_prompting() {
            return false;
        }
        match self.confirm_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PresenceEvent>> {
        self.events_rx.take()
    }

    pub async fn stop(self) {
        self.task.stop().await;
    }
}

async fn presence_loop(
    confirmer: PresenceConfirmer,
    counter: Arc<FailureCounter>,
    settings: PresenceSettings,
    mut confirm_rx: mpsc::Receiver<()>,
    pending_tx: watch::Sender<bool>,
    events_tx: mpsc::Sender<PresenceEvent>,
    mut shutdown: Shutdown,
) {
    let post_id = confirmer.post_id();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.progress) => {}
            _ = shutdown.triggered() => break,
        }

        // Answers given before the prompt do not count.
        while confirm_rx.try_recv().is_ok() {}
        pending_tx.send_replace(true);
        let _ = events_tx
            .send(PresenceEvent::Prompt {
                answer_window: settings.answer_window,
            })
            .await;

        let event = tokio::select! {
            answered = confirm_rx.recv() => {
                if answered.is_none() {
                    break;
                }
                if let Err(e) = confirmer.confirm().await {
                    warn!(post_id, error = %e, "Presence heartbeat failed.");
                }
                PresenceEvent::Confirmed
            }
            _ = tokio::time::sleep(settings.answer_window) => {
                info!(post_id, "Presence prompt unanswered.");
                PresenceEvent::Missed(counter.increment(post_id).await)
            }
            _ = shutdown.triggered() => break,
        };
        pending_tx.send_replace(false);
        let _ = events_tx.send(event).await;
    }
    pending_tx.send_replace(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventKind, MemoryStore, Post};
    use crate::local_storage::LocalStorage;
    use crate::monitoring::connectivity::Connectivity;
    use crate::monitoring::emitter::Emitter;
    use crate::monitoring::failure_counter::FailureTallies;
    use crate::monitoring::heartbeat::{HeartbeatController, HeartbeatSettings};
    use crate::monitoring::offline_queue::OfflineQueue;
    use crate::notifications::NoticeBroadcaster;

    #[test]
    fn test_settings_from_config() {
        let settings = PresenceSettings::from(&ComplianceConfig::default_for(1));
        assert_eq!(settings.progress, Duration::from_secs(30 * 60));
        assert_eq!(settings.answer_window, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_prompt_counts_failure_and_answered_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.add_post(Post {
            id: 1,
            company_id: 1,
            name: "Portaria".into(),
            location: "Rua A".into(),
            blocked: false,
            access_secret: "s".into(),
            last_heartbeat: None,
        });
        let notices = NoticeBroadcaster::default();
        let emitter = Emitter::new(
            store.clone(),
            Connectivity::new(true),
            Arc::new(OfflineQueue::open(LocalStorage::open(dir.path()).unwrap())),
            notices.clone(),
        );
        let controller = HeartbeatController::new(
            store.clone(),
            emitter.clone(),
            HeartbeatSettings {
                interval: Duration::from_secs(3600),
                takeover_threshold: Duration::from_secs(7200),
            },
        );
        let session = controller.start(1, "s").await.unwrap();
        let counter = Arc::new(FailureCounter::new(
            store.clone(),
            emitter,
            Arc::new(FailureTallies::default()),
            notices,
        ));

        let settings = PresenceSettings {
            progress: Duration::from_secs(60),
            answer_window: Duration::from_secs(10),
        };
        let mut cycle = PresenceCycle::spawn(session.presence_confirmer(), counter, settings);
        let mut events = cycle.take_events().unwrap();
        assert!(!cycle.confirm());

        assert!(matches!(events.recv().await, Some(PresenceEvent::Prompt { .. })));
        assert_eq!(
            events.recv().await,
            Some(PresenceEvent::Missed(CounterOutcome::Confirmed(1)))
        );

        assert!(matches!(events.recv().await, Some(PresenceEvent::Prompt { .. })));
        assert!(cycle.confirm());
        assert_eq!(events.recv().await, Some(PresenceEvent::Confirmed));
        assert!(!cycle.is_prompting());
        assert!(!cycle.confirm());

        let failures = store
            .stored_events()
            .into_iter()
            .filter(|e| e.kind == EventKind::VigilantFailure)
            .count();
        assert_eq!(failures, 1);

        cycle.stop().await;
        session.exit().await;
    }
}

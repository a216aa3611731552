use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::db::EventKind;

/// A user-facing outcome that the operator should see.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// An online write was refused; the event is lost, not queued.
    EventNotRecorded {
        post_id: i64,
        kind: EventKind,
        cause: String,
    },
    /// Replay failed; the queue was kept for the next attempt.
    SyncFailed { pending: usize, cause: String },
    /// Events landed but the failure tallies of these posts are stale.
    SyncPartial { synced: usize, stale_posts: Vec<i64> },
    SyncComplete { synced: usize },
    /// The failure event was stored but the tally was not.
    CounterNotSaved { post_id: i64, cause: String },
}

impl Notice {
    pub fn is_error(&self) -> bool {
        !matches!(self, Notice::SyncComplete { .. })
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notice::EventNotRecorded { .. } => "Event not recorded",
            Notice::SyncFailed { .. } => "Sync failed",
            Notice::SyncPartial { .. } => "Sync partially completed",
            Notice::SyncComplete { .. } => "Sync complete",
            Notice::CounterNotSaved { .. } => "Failure tally not saved",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notice::EventNotRecorded {
                post_id,
                kind,
                cause,
            } => format!("Could not record '{kind}' for post {post_id}: {cause}"),
            Notice::SyncFailed { pending, cause } => format!(
                "{pending} offline event(s) could not be sent and will be retried: {cause}"
            ),
            Notice::SyncPartial {
                synced,
                stale_posts,
            } => format!(
                "{synced} offline event(s) were recorded, but the failure tallies of posts {stale_posts:?} could not be updated."
            ),
            Notice::SyncComplete { synced } => {
                format!("{synced} offline event(s) were sent.")
            }
            Notice::CounterNotSaved { post_id, cause } => format!(
                "The failure was recorded for post {post_id}, but its tally could not be saved: {cause}"
            ),
        }
    }
}

/// Fans notices out to whoever displays them.
#[derive(Debug, Clone)]
pub struct NoticeBroadcaster {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NoticeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        if notice.is_error() {
            warn!(title = notice.title(), "{}", notice.message());
        } else {
            info!(title = notice.title(), "{}", notice.message());
        }
        // Nobody listening is fine: the log line above already carries it.
        let _ = self.tx.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notices = NoticeBroadcaster::default();
        let mut rx = notices.subscribe();
        notices.publish(Notice::SyncComplete { synced: 2 });
        let got = rx.recv().await.unwrap();
        assert_eq!(got, Notice::SyncComplete { synced: 2 });
        assert!(!got.is_error());
    }

    #[test]
    fn test_messages_name_kind_and_cause() {
        let notice = Notice::EventNotRecorded {
            post_id: 3,
            kind: EventKind::PanicButton,
            cause: "permission denied".into(),
        };
        let message = notice.message();
        assert!(message.contains("Botão de Pânico"));
        assert!(message.contains("permission denied"));

        // Publishing without subscribers must not panic.
        NoticeBroadcaster::default().publish(notice);
    }
}

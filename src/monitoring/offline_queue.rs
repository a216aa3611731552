use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::connectivity::Connectivity;
use super::failure_counter::FailureTallies;
use crate::db::{EventKind, MonitoringStore, NewEvent, StoreError};
use crate::local_storage::LocalStorage;
use crate::notifications::{Notice, NoticeBroadcaster};
use crate::tasks::Shutdown;

pub const OFFLINE_QUEUE_KEY: &str = "offlineEventQueue";

/// An event captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEntry {
    pub post_id: i64,
    #[serde(alias = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl OfflineEntry {
    pub fn now(post_id: i64, kind: EventKind) -> Self {
        Self {
            post_id,
            kind,
            timestamp: Utc::now(),
        }
    }

    fn to_new_event(&self) -> NewEvent {
        NewEvent::unresolved(self.post_id, self.kind).captured_at(self.timestamp)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Bulk insert of {pending} queued event(s) failed: {source}")]
    BulkInsert {
        pending: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Nothing was queued.
    Empty,
    Complete { synced: usize },
    /// Events are durable; the tallies of `stale_posts` were not updated.
    Partial { synced: usize, stale_posts: Vec<i64> },
    /// Nothing was written; the queue is intact.
    Failed(SyncError),
}

/// Local buffer of events that still need to reach the store.
///
/// Every mutation is written through to local storage so a restart does not
/// lose entries.
pub struct OfflineQueue {
    entries: Mutex<Vec<OfflineEntry>>,
    storage: LocalStorage,
    drain_lock: AsyncMutex<()>,
}

impl OfflineQueue {
    pub fn open(storage: LocalStorage) -> Self {
        let entries = match storage.get::<Vec<OfflineEntry>>(OFFLINE_QUEUE_KEY) {
            Ok(Some(entries)) => {
                if !entries.is_empty() {
                    info!(pending = entries.len(), "Restored offline event queue.");
                }
                entries
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "Offline event queue is unreadable. Starting empty.");
                Vec::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            storage,
            drain_lock: AsyncMutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OfflineEntry>> {
        // A panic while holding this lock cannot leave the Vec half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &[OfflineEntry]) {
        let result = if entries.is_empty() {
            self.storage.remove(OFFLINE_QUEUE_KEY)
        } else {
            self.storage.set(OFFLINE_QUEUE_KEY, entries)
        };
        if let Err(e) = result {
            error!(error = %e, pending = entries.len(), "Failed to persist offline event queue.");
        }
    }

    /// Never fails; a persistence error is logged and the entry stays in memory.
    pub fn enqueue(&self, entry: OfflineEntry) {
        let mut entries = self.lock();
        entries.push(entry);
        self.persist(&entries);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<OfflineEntry> {
        self.lock().clone()
    }

    /// Replays the buffered batch in one bulk insert.
    ///
    /// The buffer is cleared only after the insert succeeded, and before the
    /// failure tallies are touched. Entries enqueued while the insert was in
    /// flight stay queued for the next drain.
    pub async fn drain_and_sync(
        &self,
        store: &dyn MonitoringStore,
        tallies: &FailureTallies,
        notices: &NoticeBroadcaster,
    ) -> SyncOutcome {
        let _draining = self.drain_lock.lock().await;

        let batch = self.snapshot();
        if batch.is_empty() {
            return SyncOutcome::Empty;
        }
        info!(pending = batch.len(), "Syncing offline events.");

        let new_events = batch.iter().map(OfflineEntry::to_new_event).collect();
        if let Err(source) = store.insert_events(new_events).await {
            let cause = source.to_string();
            notices.publish(Notice::SyncFailed {
                pending: batch.len(),
                cause,
            });
            return SyncOutcome::Failed(SyncError::BulkInsert {
                pending: batch.len(),
                source,
            });
        }

        {
            let mut entries = self.lock();
            entries.drain(..batch.len());
            self.persist(&entries);
        }
        let synced = batch.len();

        let mut deltas: BTreeMap<i64, i64> = BTreeMap::new();
        for entry in batch.iter().filter(|e| e.kind == EventKind::VigilantFailure) {
            *deltas.entry(entry.post_id).or_default() += 1;
        }

        let mut stale_posts = Vec::new();
        for (post_id, delta) in deltas {
            let result = async {
                let current = store.failure_count(post_id).await?.unwrap_or(0);
                let updated = current + delta;
                store.upsert_failure_count(post_id, updated).await?;
                Ok::<i64, StoreError>(updated)
            }
            .await;
            match result {
                Ok(updated) => {
                    debug!(post_id, delta, updated, "Failure tally reconciled after sync.");
                    tallies.set(post_id, updated);
                }
                Err(e) => {
                    warn!(post_id, delta, error = %e, "Failure tally not updated after sync.");
                    stale_posts.push(post_id);
                }
            }
        }

        if stale_posts.is_empty() {
            notices.publish(Notice::SyncComplete { synced });
            SyncOutcome::Complete { synced }
        } else {
            notices.publish(Notice::SyncPartial {
                synced,
                stale_posts: stale_posts.clone(),
            });
            SyncOutcome::Partial {
                synced,
                stale_posts,
            }
        }
    }
}

/// Drains once at start if online, then once per offline-to-online edge.
pub async fn sync_watcher(
    queue: Arc<OfflineQueue>,
    store: Arc<dyn MonitoringStore>,
    tallies: Arc<FailureTallies>,
    notices: NoticeBroadcaster,
    connectivity: Connectivity,
    mut shutdown: Shutdown,
) {
    let mut online_rx = connectivity.subscribe();
    let mut was_online = *online_rx.borrow_and_update();
    if was_online && !queue.is_empty() {
        queue.drain_and_sync(store.as_ref(), &tallies, &notices).await;
    }

    loop {
        tokio::select! {
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                if online && !was_online {
                    queue.drain_and_sync(store.as_ref(), &tallies, &notices).await;
                }
                was_online = online;
            }
            _ = shutdown.triggered() => break,
        }
    }
}

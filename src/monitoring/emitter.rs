use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::connectivity::Connectivity;
use super::offline_queue::{OfflineEntry, OfflineQueue};
use crate::db::{EventKind, MonitoringEvent, MonitoringStore, NewEvent, StoreError};
use crate::notifications::{Notice, NoticeBroadcaster};

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Durably recorded by the store.
    Ack(MonitoringEvent),
    /// Buffered locally until connectivity returns.
    Queued,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmitError {
    #[error("Could not record '{kind}': {source}")]
    Rejected {
        kind: EventKind,
        #[source]
        source: StoreError,
    },
}

/// Single entry point for recording monitoring events.
#[derive(Clone)]
pub struct Emitter {
    store: Arc<dyn MonitoringStore>,
    connectivity: Connectivity,
    queue: Arc<OfflineQueue>,
    notices: NoticeBroadcaster,
}

impl Emitter {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        connectivity: Connectivity,
        queue: Arc<OfflineQueue>,
        notices: NoticeBroadcaster,
    ) -> Self {
        Self {
            store,
            connectivity,
            queue,
            notices,
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Records `kind` for `post_id`.
    ///
    /// Offline, the event is queued with the current time and `Queued` is
    /// returned without touching the store. Online, exactly one insert is
    /// attempted; a failed attempt is reported and dropped, never queued.
    pub async fn emit(&self, post_id: i64, kind: EventKind) -> Result<Emission, EmitError> {
        if !self.connectivity.is_online() {
            self.queue.enqueue(OfflineEntry::now(post_id, kind));
            debug!(post_id, kind = %kind, "Offline: event queued.");
            return Ok(Emission::Queued);
        }

        match self.store.insert_event(NewEvent::unresolved(post_id, kind)).await {
            Ok(row) => {
                debug!(post_id, kind = %kind, event_id = row.id, "Event recorded.");
                Ok(Emission::Ack(row))
            }
            Err(source) => {
                error!(post_id, kind = %kind, error = %source, "Failed to record event.");
                self.notices.publish(Notice::EventNotRecorded {
                    post_id,
                    kind,
                    cause: source.to_string(),
                });
                Err(EmitError::Rejected { kind, source })
            }
        }
    }

    /// Fire-and-forget insert for teardown paths. Skips the queue and any
    /// notice; the write may never complete.
    pub fn emit_detached(&self, post_id: i64, kind: EventKind) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(post_id, kind = %kind, "No runtime left to send teardown event.");
            return;
        };
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            if let Err(e) = store.insert_event(NewEvent::unresolved(post_id, kind)).await {
                warn!(post_id, kind = %kind, error = %e, "Teardown event was not recorded.");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::local_storage::LocalStorage;

    fn emitter(store: Arc<MemoryStore>, online: bool, dir: &std::path::Path) -> Emitter {
        let storage = LocalStorage::open(dir).unwrap();
        Emitter::new(
            store,
            Connectivity::new(online),
            Arc::new(OfflineQueue::open(storage)),
            NoticeBroadcaster::default(),
        )
    }

    #[tokio::test]
    async fn test_offline_emits_are_all_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let emitter = emitter(Arc::clone(&store), false, dir.path());

        for kind in [EventKind::PanicButton, EventKind::VigilantFailure, EventKind::PanicButton] {
            assert_eq!(emitter.emit(4, kind).await.unwrap(), Emission::Queued);
        }
        assert_eq!(emitter.queue().len(), 3);
        assert!(store.stored_events().is_empty());
    }

    #[tokio::test]
    async fn test_online_emit_is_recorded_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let emitter = emitter(Arc::clone(&store), true, dir.path());

        let Emission::Ack(row) = emitter.emit(4, EventKind::SystemActivated).await.unwrap() else {
            panic!("expected an ack");
        };
        assert_eq!(row.status, crate::db::EventStatus::Unresolved);
        assert_eq!(store.stored_events(), vec![row]);
    }

    #[tokio::test]
    async fn test_failed_online_emit_is_reported_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_event_writes(true);
        let emitter = emitter(Arc::clone(&store), true, dir.path());
        let mut notices = emitter.notices.subscribe();

        let err = emitter.emit(4, EventKind::PanicButton).await.unwrap_err();
        assert!(matches!(err, EmitError::Rejected { kind: EventKind::PanicButton, .. }));
        assert!(emitter.queue().is_empty());
        assert!(matches!(
            notices.recv().await.unwrap(),
            Notice::EventNotRecorded { post_id: 4, kind: EventKind::PanicButton, .. }
        ));
    }

    #[tokio::test]
    async fn test_detached_emit_reaches_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut feed = store.subscribe_events().await.unwrap();
        let emitter = emitter(Arc::clone(&store), false, dir.path());

        emitter.emit_detached(9, EventKind::GatehouseOffline);
        let change = feed.recv().await.unwrap().into_change().unwrap();
        assert_eq!(change.row.kind, EventKind::GatehouseOffline);
        assert!(emitter.queue().is_empty());
    }
}

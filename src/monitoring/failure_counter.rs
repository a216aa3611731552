use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::emitter::{Emission, Emitter};
use crate::db::{EventKind, FailureCount, MonitoringStore};
use crate::notifications::{Notice, NoticeBroadcaster};

/// In-memory failure tallies per post, as displayed to the operator.
#[derive(Debug, Default)]
pub struct FailureTallies {
    counts: DashMap<i64, i64>,
}

impl FailureTallies {
    pub fn get(&self, post_id: i64) -> i64 {
        self.counts.get(&post_id).map(|count| *count).unwrap_or(0)
    }

    pub fn set(&self, post_id: i64, count: i64) {
        self.counts.insert(post_id, count.max(0));
    }

    /// Applies `delta` and returns the new value, never below zero.
    pub fn adjust(&self, post_id: i64, delta: i64) -> i64 {
        let mut entry = self.counts.entry(post_id).or_insert(0);
        *entry = (*entry + delta).max(0);
        *entry
    }

    pub fn seed(&self, rows: impl IntoIterator<Item = FailureCount>) {
        self.counts.clear();
        for row in rows {
            self.set(row.post_id, row.count);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOutcome {
    /// Event and tally are both durable.
    Confirmed(i64),
    /// The event was queued offline; the tally is provisional until the
    /// queue drains.
    Deferred(i64),
    /// The optimistic increment was undone.
    RolledBack { restored: i64, reason: String },
}

pub struct FailureCounter {
    store: Arc<dyn MonitoringStore>,
    emitter: Emitter,
    tallies: Arc<FailureTallies>,
    notices: NoticeBroadcaster,
}

impl FailureCounter {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        emitter: Emitter,
        tallies: Arc<FailureTallies>,
        notices: NoticeBroadcaster,
    ) -> Self {
        Self {
            store,
            emitter,
            tallies,
            notices,
        }
    }

    pub fn tallies(&self) -> &Arc<FailureTallies> {
        &self.tallies
    }

    /// Records a missed presence confirmation for `post_id`.
    pub async fn increment(&self, post_id: i64) -> CounterOutcome {
        let tentative = self.tallies.adjust(post_id, 1);

        match self.emitter.emit(post_id, EventKind::VigilantFailure).await {
            // The drain writes the tally for queued events.
            Ok(Emission::Queued) => CounterOutcome::Deferred(tentative),
            Ok(Emission::Ack(_)) => match self.store.upsert_failure_count(post_id, tentative).await {
                Ok(()) => {
                    debug!(post_id, count = tentative, "Failure tally saved.");
                    CounterOutcome::Confirmed(tentative)
                }
                Err(e) => {
                    let restored = self.tallies.adjust(post_id, -1);
                    warn!(post_id, error = %e, "Failure tally not saved. Rolled back.");
                    self.notices.publish(Notice::CounterNotSaved {
                        post_id,
                        cause: e.to_string(),
                    });
                    CounterOutcome::RolledBack {
                        restored,
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                let restored = self.tallies.adjust(post_id, -1);
                CounterOutcome::RolledBack {
                    restored,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn reset(&self, post_id: i64) -> Result<(), crate::db::StoreError> {
        self.store.upsert_failure_count(post_id, 0).await?;
        self.tallies.set(post_id, 0);
        Ok(())
    }
}

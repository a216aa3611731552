use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::error;

use crate::local_storage::LocalStorage;

pub const HIDDEN_EVENTS_KEY: &str = "hiddenEventIds";

/// Event ids the viewer chose to hide from their timeline. Persisted locally.
pub struct HiddenEvents {
    ids: Mutex<BTreeSet<i64>>,
    storage: LocalStorage,
}

impl HiddenEvents {
    pub fn open(storage: LocalStorage) -> Self {
        let ids = match storage.get::<Vec<i64>>(HIDDEN_EVENTS_KEY) {
            Ok(ids) => ids.unwrap_or_default().into_iter().collect(),
            Err(e) => {
                error!(error = %e, "Hidden events set is unreadable. Starting empty.");
                BTreeSet::new()
            }
        };
        Self {
            ids: Mutex::new(ids),
            storage,
        }
    }

    fn with_ids<R>(&self, f: impl FnOnce(&mut BTreeSet<i64>) -> R) -> R {
        let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut ids)
    }

    fn persist(&self, ids: &BTreeSet<i64>) {
        let list: Vec<i64> = ids.iter().copied().collect();
        if let Err(e) = self.storage.set(HIDDEN_EVENTS_KEY, &list) {
            error!(error = %e, "Failed to save hidden events.");
        }
    }

    pub fn hide(&self, event_ids: impl IntoIterator<Item = i64>) {
        self.with_ids(|ids| {
            ids.extend(event_ids);
            self.persist(ids);
        });
    }

    pub fn restore_all(&self) {
        self.with_ids(|ids| {
            ids.clear();
            self.persist(ids);
        });
    }

    pub fn contains(&self, event_id: i64) -> bool {
        self.with_ids(|ids| ids.contains(&event_id))
    }

    pub fn snapshot(&self) -> BTreeSet<i64> {
        self.with_ids(|ids| ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hide_persists_and_restore_empties() {
        let dir = tempfile::tempdir().unwrap();
        let hidden = HiddenEvents::open(LocalStorage::open(dir.path()).unwrap());
        hidden.hide([4, 2]);
        hidden.hide([2, 7]);
        assert!(hidden.contains(4));

        let reopened = HiddenEvents::open(LocalStorage::open(dir.path()).unwrap());
        assert_eq!(reopened.snapshot(), BTreeSet::from([2, 4, 7]));

        reopened.restore_all();
        let again = HiddenEvents::open(LocalStorage::open(dir.path()).unwrap());
        assert!(again.snapshot().is_empty());
    }
}

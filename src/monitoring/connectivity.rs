use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::tasks::Shutdown;

/// Shared online/offline flag. Only the probe and tests flip it; the emitter
/// and the offline-queue watcher read it.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Connectivity restored.");
            } else {
                warn!("Connectivity lost. New events will be queued locally.");
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Polls a health URL and mirrors the result into [`Connectivity`].
pub struct ReachabilityProbe {
    client: Client,
    url: String,
    interval: Duration,
}

impl ReachabilityProbe {
    pub fn new(url: String, interval: Duration, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            interval,
        })
    }

    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                // Any HTTP answer proves a network path, even an error status.
                debug!(status = %response.status(), "Reachability probe answered.");
                true
            }
            Err(e) => {
                debug!(error = %e, "Reachability probe failed.");
                false
            }
        }
    }

    pub async fn run(self, connectivity: Connectivity, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let online = self.check().await;
                    connectivity.set_online(online);
                }
                _ = shutdown.triggered() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_real_transitions_notify() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }
}

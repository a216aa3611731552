//! Owned background tasks with cooperative shutdown.
//!
//! Every periodic job runs under a [`TaskHandle`]. Stopping a handle flips a
//! `watch` flag that the task observes between ticks, so a store write that
//! is already in flight always completes.
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The stop signal as seen from inside a task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop was requested or the owning handle is gone.
    pub async fn triggered(&mut self) {
        // An Err means the sender was dropped, which also counts as a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

pub struct TaskHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, rx) = watch::channel(false);
        let join = tokio::spawn(task(Shutdown { rx }));
        debug!(task = name, "Background task started.");
        Self {
            name,
            stop_tx,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Requests a stop without waiting for the task to wind down.
    pub fn signal(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Requests a stop and waits for the task to return.
    pub async fn stop(mut self) {
        self.signal();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(task = self.name, error = %e, "Background task ended abnormally.");
            }
        }
        debug!(task = self.name, "Background task stopped.");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_current_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = TaskHandle::spawn("ticker", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = shutdown.triggered() => break,
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_dropping_handle_signals_stop() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = TaskHandle::spawn("dropped", move |mut shutdown| async move {
            shutdown.triggered().await;
            let _ = done_tx.send(shutdown.is_triggered());
        });
        drop(handle);
        assert!(done_rx.await.unwrap());
    }
}

//! # Connectivity Monitor
//!
//! Single online/offline flag shared by the till and the scheduler.
//!
//! ```text
//! probe / OS event ──set_online(bool)──► watch::Sender<bool>
//!                                             │
//!                           ┌─────────────────┴─────────────────┐
//!                           ▼                                   ▼
//!                  capture(): is_online()?          scheduler loop: changed()
//!                  attempt immediately              offline → online edge
//!                                                   settle, then drain
//! ```
//!
//! Only real transitions notify subscribers, so a probe that reports
//! "online" every few seconds does not retrigger a drain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        ConnectivityMonitor { tx: Arc::new(tx) }
    }

    /// Records the current state. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
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
                info!("Connectivity restored");
            } else {
                info!("Connectivity lost, sales will queue locally");
            }
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Polls `probe` every `interval` and feeds the result in.
    ///
    /// The task runs until the handle is aborted.
    pub fn spawn_probe<F, Fut>(&self, interval: Duration, probe: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.set_online(probe().await);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        ConnectivityMonitor::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_transitions_notify() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(!rx.has_changed().unwrap());

        assert!(monitor.set_online(true));
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_updates_state() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        let handle = monitor.spawn_probe(Duration::from_secs(5), || async { true });

        rx.changed().await.unwrap();
        assert!(monitor.is_online());
        handle.abort();
    }
}

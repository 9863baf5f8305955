//! Connectivity monitor.
//!
//! Holds the current reachability of the authority and announces edges
//! (offline -> online and back). The engine resets its backoff and drains
//! immediately on every `WentOnline`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

/// A subscription to connectivity edges.
pub struct TransitionSubscription {
    receiver: broadcast::Receiver<Transition>,
}

impl TransitionSubscription {
    pub async fn recv(&mut self) -> Result<Transition, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    edges: broadcast::Sender<Transition>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (edges, _) = broadcast::channel(16);
        Self { state, edges }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the latest observation. Only a change of state emits a
    /// transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }
        let transition = if online {
            tracing::info!("[connectivity] Authority reachable");
            Transition::WentOnline
        } else {
            tracing::warn!("[connectivity] Authority unreachable");
            Transition::WentOffline
        };
        let _ = self.edges.send(transition);
    }

    pub fn subscribe(&self) -> TransitionSubscription {
        TransitionSubscription {
            receiver: self.edges.subscribe(),
        }
    }

    /// Watch the current state (used by status reporting).
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Poll `probe` every `interval` and feed its answer into the monitor.
    pub fn spawn_probe<F, Fut>(self: &Arc<Self>, interval: Duration, probe: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let monitor = Arc::clone(self);
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
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_only_edges_are_announced() {
        let monitor = ConnectivityMonitor::new(false);
        let mut edges = monitor.subscribe();

        monitor.set_online(false);
        monitor.set_online(true);
        monitor.set_online(true);
        monitor.set_online(false);

        assert_eq!(edges.recv().await.unwrap(), Transition::WentOnline);
        assert_eq!(edges.recv().await.unwrap(), Transition::WentOffline);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_drives_state() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let reachable = Arc::new(AtomicBool::new(true));
        let mut edges = monitor.subscribe();

        let flag = Arc::clone(&reachable);
        let handle = monitor.spawn_probe(Duration::from_millis(10), move || {
            let flag = Arc::clone(&flag);
            async move { flag.load(Ordering::SeqCst) }
        });

        assert_eq!(edges.recv().await.unwrap(), Transition::WentOnline);
        reachable.store(false, Ordering::SeqCst);
        assert_eq!(edges.recv().await.unwrap(), Transition::WentOffline);
        handle.abort();
    }
}

//! Realtime Merge Listener: folds the tenant change feed into the Local
//! Store without clobbering work the device has not sent yet.

use super::backoff::Backoff;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::error::StoreError;
use crate::remote::{ChangeEvent, RemoteAuthority};
use crate::store::{LocalStore, MergeOutcome, StoreEvent};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub struct RealtimeMergeListener {
    store: Arc<LocalStore>,
    authority: Arc<dyn RemoteAuthority>,
    connectivity: Arc<ConnectivityMonitor>,
    tenant_id: String,
    config: SyncConfig,
}

impl RealtimeMergeListener {
    pub fn new(
        store: Arc<LocalStore>,
        authority: Arc<dyn RemoteAuthority>,
        connectivity: Arc<ConnectivityMonitor>,
        tenant_id: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            authority,
            connectivity,
            tenant_id: tenant_id.into(),
            config,
        }
    }

    /// Apply one event, replaying deferred work when it was queued behind
    /// something that may already be clear.
    pub fn handle_event(&self, event: &ChangeEvent) -> Result<MergeOutcome, StoreError> {
        let outcome = self.store.apply_change(event)?;
        debug!(
            "[merge] {} {} seq {}: {:?}",
            event.entity_kind(),
            event.canonical_id,
            event.server_sequence,
            outcome
        );
        if outcome == MergeOutcome::Deferred {
            self.replay_deferred();
        }
        Ok(outcome)
    }

    fn replay_deferred(&self) {
        match self.store.apply_ready_deferred() {
            Ok(0) => {}
            Ok(n) => info!("[merge] Applied {} deferred changes", n),
            Err(e) => error!("[merge] Replaying deferred changes failed: {}", e),
        }
    }

    /// Run until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut edges = self.connectivity.subscribe();
        let mut store_events = self.store.subscribe();
        let mut backoff = Backoff::new(self.config.backoff(), self.config.max_backoff());

        // Whatever was deferred before a restart may be unblocked by now
        self.replay_deferred();

        loop {
            if !self.connectivity.is_online() {
                // Drains at the fallback tick can still resolve queue entries
                tokio::select! {
                    edge = edges.recv() => match edge {
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return,
                    },
                    event = store_events.recv() => match event {
                        Ok(StoreEvent::QueueResolved { .. }) | Err(RecvError::Lagged(_)) => {
                            self.replay_deferred();
                            continue;
                        }
                        Ok(_) => continue,
                        Err(RecvError::Closed) => return,
                    },
                }
            }

            let mut feed = match self.authority.subscribe(&self.tenant_id).await {
                Ok(feed) => {
                    info!("[merge] Subscribed to changes for {}", self.tenant_id);
                    feed
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("[merge] Subscribe failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    next = feed.next() => match next {
                        Some(Ok(event)) => {
                            backoff.reset();
                            if let Err(e) = self.handle_event(&event) {
                                error!("[merge] Failed to apply {}: {}", event.canonical_id, e);
                            }
                        }
                        Some(Err(e)) => {
                            warn!("[merge] Change feed error: {}", e);
                            break;
                        }
                        None => {
                            info!("[merge] Change feed ended");
                            break;
                        }
                    },
                    event = store_events.recv() => match event {
                        Ok(StoreEvent::QueueResolved { .. }) | Err(RecvError::Lagged(_)) => {
                            self.replay_deferred();
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => return,
                    },
                    edge = edges.recv() => match edge {
                        Ok(Transition::WentOffline) => {
                            info!("[merge] Offline, dropping feed");
                            break;
                        }
                        Ok(Transition::WentOnline) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    },
                }
            }

            let delay = backoff.next_delay();
            debug!("[merge] Resubscribing in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

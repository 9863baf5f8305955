//! Sync Engine: drains the queue against the remote authority.
//!
//! Each drain round dispatches the head of every ready dependency chain
//! concurrently (bounded by `max_in_flight`) and settles the answers as they
//! arrive. A chain never has more than one entry in flight, so replies that
//! come back out of order can only reorder independent tabs.
//!
//! The loop wakes on:
//! - a `WentOnline` edge (backoff reset, immediate drain)
//! - a new queue entry, when online and no retry delay is in effect
//! - the retry delay while online, otherwise the coarse fallback tick

use super::backoff::Backoff;
use super::status::EngineProgress;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Transition, TransitionSubscription};
use crate::error::StoreError;
use crate::identity::EntityId;
use crate::remote::{NewTab, RemoteAuthority, RemoteError};
use crate::store::{LocalStore, Mutation, QueueEntry, StoreEvent, StoreSubscription};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Reply from the authority for one entry.
#[derive(Debug)]
enum Acknowledged {
    Created {
        canonical_id: String,
        number: Option<u64>,
    },
    Updated,
}

/// Result of handing one entry to the authority.
#[derive(Debug)]
enum Dispatch {
    Sent(Result<Acknowledged, RemoteError>),
    /// The entry cannot be sent as it stands
    Park(String),
}

/// Counts from one call to [`SyncEngine::drain_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub acknowledged: usize,
    pub transient_failures: usize,
    pub terminal_failures: usize,
    pub parked: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == DrainReport::default()
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    authority: Arc<dyn RemoteAuthority>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    progress: watch::Sender<EngineProgress>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        authority: Arc<dyn RemoteAuthority>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let (progress, _) = watch::channel(EngineProgress::default());
        Self {
            store,
            authority,
            connectivity,
            config,
            progress,
        }
    }

    /// Follow what the engine last did.
    pub fn progress(&self) -> watch::Receiver<EngineProgress> {
        self.progress.subscribe()
    }

    /// Send everything that is ready, round after round, until the queue is
    /// empty or a round hits a transient failure.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        let limit = self.config.max_in_flight.max(1);
        self.progress
            .send_modify(|p| p.last_attempt_at = Some(Utc::now()));

        loop {
            let heads = self.store.ready_heads(limit)?;
            if heads.is_empty() {
                break;
            }
            debug!("[sync] Dispatching {} chain heads", heads.len());

            let mut in_flight: FuturesUnordered<_> = heads
                .into_iter()
                .map(|entry| async move {
                    let dispatch = self.dispatch(&entry).await;
                    (entry, dispatch)
                })
                .collect();

            let mut round_transient = 0;
            while let Some((entry, dispatch)) = in_flight.next().await {
                match self.settle(&entry, dispatch).await? {
                    Settled::Acknowledged => report.acknowledged += 1,
                    Settled::Transient => round_transient += 1,
                    Settled::Terminal => report.terminal_failures += 1,
                    Settled::Parked => report.parked += 1,
                }
            }
            if round_transient > 0 {
                report.transient_failures += round_transient;
                break;
            }
        }

        if report.transient_failures == 0 {
            self.progress
                .send_modify(|p| p.last_success_at = Some(Utc::now()));
        }
        Ok(report)
    }

    async fn dispatch(&self, entry: &QueueEntry) -> Dispatch {
        let call = async {
            match &entry.mutation {
                Mutation::OpenTab {
                    tenant_id,
                    number,
                    opened_at,
                } => {
                    let Some(local) = entry.target.as_local() else {
                        return Dispatch::Park(format!("tab {} was already created", entry.target));
                    };
                    let payload = NewTab {
                        number: *number,
                        opened_at: *opened_at,
                    };
                    Dispatch::Sent(
                        self.authority
                            .create_tab(local, tenant_id, &payload)
                            .await
                            .map(|created| Acknowledged::Created {
                                canonical_id: created.canonical_id,
                                number: created.number,
                            }),
                    )
                }
                Mutation::AddLineItem { tab, draft } => {
                    let Some(local) = entry.target.as_local() else {
                        return Dispatch::Park(format!("item {} was already created", entry.target));
                    };
                    let Some(tab_ref) = tab.as_canonical() else {
                        return Dispatch::Park(format!("owning tab {} has no server identity", tab));
                    };
                    Dispatch::Sent(
                        self.authority
                            .add_line_item(local, tab_ref, draft)
                            .await
                            .map(|created| Acknowledged::Created {
                                canonical_id: created.canonical_id,
                                number: None,
                            }),
                    )
                }
                Mutation::CloseTab { payment } => {
                    let Some(tab_ref) = entry.target.as_canonical() else {
                        return Dispatch::Park(format!("tab {} has no server identity", entry.target));
                    };
                    Dispatch::Sent(
                        self.authority
                            .close_tab(tab_ref, payment)
                            .await
                            .map(|_| Acknowledged::Updated),
                    )
                }
                Mutation::CancelTab { reason } => {
                    let Some(tab_ref) = entry.target.as_canonical() else {
                        return Dispatch::Park(format!("tab {} has no server identity", entry.target));
                    };
                    Dispatch::Sent(
                        self.authority
                            .cancel_tab(tab_ref, reason.as_deref())
                            .await
                            .map(|_| Acknowledged::Updated),
                    )
                }
            }
        };

        match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(dispatch) => dispatch,
            Err(_) => Dispatch::Sent(Err(RemoteError::Transient(format!(
                "no answer within {:?}",
                self.config.request_timeout()
            )))),
        }
    }

    async fn settle(&self, entry: &QueueEntry, dispatch: Dispatch) -> Result<Settled, StoreError> {
        let seq = entry.seq;
        match dispatch {
            Dispatch::Park(reason) => {
                self.store.park(seq, &reason)?;
                Ok(Settled::Parked)
            }
            Dispatch::Sent(Ok(Acknowledged::Created {
                canonical_id,
                number,
            })) => match self.store.complete_create(seq, &canonical_id, number) {
                Ok(()) => {
                    debug!("[sync] Entry {} created as {}", seq, canonical_id);
                    Ok(Settled::Acknowledged)
                }
                Err(StoreError::MissingRecord(reason)) => {
                    self.store.park(seq, &reason)?;
                    Ok(Settled::Parked)
                }
                Err(e) => Err(e),
            },
            Dispatch::Sent(Ok(Acknowledged::Updated)) => {
                self.store.complete_update(seq)?;
                debug!("[sync] Entry {} acknowledged", seq);
                Ok(Settled::Acknowledged)
            }
            Dispatch::Sent(Err(RemoteError::Transient(reason))) => {
                let attempts = self.store.mark_failed(seq, &reason)?;
                warn!(
                    "[sync] Entry {} ({} {}) failed, attempt {}: {}",
                    seq,
                    entry.kind(),
                    entry.target,
                    attempts,
                    reason
                );
                Ok(Settled::Transient)
            }
            Dispatch::Sent(Err(refused)) => {
                warn!("[sync] Entry {} refused by authority: {}", seq, refused);
                let reconciled = match entry.chain() {
                    EntityId::Canonical(tab_ref) => match self.authority.fetch_tab(tab_ref).await {
                        Ok(fetched) => Some(fetched),
                        Err(e) => {
                            // The feed brings the authoritative state later
                            warn!("[sync] Reconciliation read for {} failed: {}", tab_ref, e);
                            None
                        }
                    },
                    EntityId::Local(_) => None,
                };
                self.store
                    .resolve_terminal(seq, &refused.to_string(), reconciled.as_ref())?;
                Ok(Settled::Terminal)
            }
        }
    }

    /// Run until the task is aborted.
    ///
    /// While the monitor reports offline the engine only wakes on the coarse
    /// fallback tick or a `WentOnline` edge; backoff paces retries online.
    pub async fn run(self: Arc<Self>) {
        let mut edges = self.connectivity.subscribe();
        let mut store_events = self.store.subscribe();
        let mut backoff = Backoff::new(self.config.backoff(), self.config.max_backoff());

        info!("[sync] Engine started");
        if !self.connectivity.is_online() {
            debug!("[sync] Offline at start, waiting for connectivity");
            let tick = self.config.fallback_interval();
            if !self.wait(tick, &mut edges, &mut store_events, &mut backoff).await {
                return;
            }
        }
        loop {
            let outcome = self.drain_once().await;
            let failed = match outcome {
                Ok(report) if report.transient_failures > 0 => true,
                Ok(report) => {
                    if !report.is_empty() {
                        info!("[sync] Drain finished: {:?}", report);
                    }
                    backoff.reset();
                    false
                }
                Err(e) => {
                    error!("[sync] Store failure while draining: {}", e);
                    true
                }
            };
            let delay = if !self.connectivity.is_online() {
                self.config.fallback_interval()
            } else if failed {
                backoff.next_delay()
            } else {
                self.config.fallback_interval()
            };
            let retry_in_ms = failed.then(|| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            self.progress.send_modify(|p| p.retry_in_ms = retry_in_ms);
            if retry_in_ms.is_some() {
                debug!("[sync] Retrying in {:?}", delay);
            }

            if !self.wait(delay, &mut edges, &mut store_events, &mut backoff).await {
                return;
            }
        }
    }

    /// Sleep until the next drain is due. Returns false once the channels
    /// feeding the engine are gone.
    async fn wait(
        &self,
        delay: Duration,
        edges: &mut TransitionSubscription,
        store_events: &mut StoreSubscription,
        backoff: &mut Backoff,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                edge = edges.recv() => match edge {
                    Ok(Transition::WentOnline) => {
                        info!("[sync] Back online, draining now");
                        backoff.reset();
                        return true;
                    }
                    Ok(Transition::WentOffline) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                },
                event = store_events.recv() => match event {
                    Ok(StoreEvent::Enqueued { .. }) | Err(RecvError::Lagged(_)) => {
                        if !backoff.is_backing_off() && self.connectivity.is_online() {
                            return true;
                        }
                    }
                    Ok(_) => continue,
                    Err(RecvError::Closed) => return false,
                },
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }
}

enum Settled {
    Acknowledged,
    Transient,
    Terminal,
    Parked,
}

//! In-memory remote authority for integration tests.
//!
//! Behaves like the real one where the engine can tell: creates are
//! deduplicated by the local id they carry, closing a closed tab is a
//! conflict, and every accepted mutation is published on the change feed.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use comanda_sync::identity::LocalId;
use comanda_sync::model::{ItemDraft, PaymentInfo, TabStatus};
use comanda_sync::remote::{
    ChangeEvent, ChangeStream, CreatedLineItem, CreatedTab, FetchedTab, NewTab, RemoteAuthority,
    RemoteError, RemoteLineItem, RemoteState, RemoteTab,
};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateTab { local_id: LocalId },
    AddLineItem { local_id: LocalId, tab: String },
    CloseTab { tab: String },
    CancelTab { tab: String },
    FetchTab { tab: String },
}

/// What to do with the next mutating call.
#[derive(Debug, Clone)]
pub enum Script {
    Fail(RemoteError),
    /// Apply the mutation but lose the acknowledgement
    DropResponse,
    Delay(Duration),
}

#[derive(Default)]
struct State {
    tabs: HashMap<String, (RemoteTab, u64)>,
    items: HashMap<String, RemoteLineItem>,
    by_local: HashMap<LocalId, String>,
    next_id: u64,
    sequence: u64,
    calls: Vec<Call>,
    script: VecDeque<Script>,
    offline: bool,
}

pub struct MemoryAuthority {
    state: Mutex<State>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            feed,
        }
    }

    pub fn script(&self, step: Script) {
        self.state.lock().unwrap().script.push_back(step);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().unwrap().tabs.len()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn tab(&self, canonical_id: &str) -> Option<RemoteTab> {
        self.state
            .lock()
            .unwrap()
            .tabs
            .get(canonical_id)
            .map(|(tab, _)| tab.clone())
    }

    pub fn canonical_for(&self, local_id: &LocalId) -> Option<String> {
        self.state.lock().unwrap().by_local.get(local_id).cloned()
    }

    /// Another device closes the tab.
    pub fn close_elsewhere(&self, canonical_id: &str) {
        let event = {
            let mut state = self.state.lock().unwrap();
            state.sequence += 1;
            let sequence = state.sequence;
            let (tab, seq) = state.tabs.get_mut(canonical_id).expect("unknown tab");
            tab.status = TabStatus::Closed;
            tab.closed_at = Some(Utc::now());
            *seq = sequence;
            tab_event(canonical_id, None, tab, sequence)
        };
        let _ = self.feed.send(event);
    }

    pub fn feed_subscribers(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Publish an arbitrary event on the feed.
    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.feed.send(event);
    }

    /// Run the scripted behaviour for the next mutating call. Returns whether
    /// the acknowledgement should be dropped.
    async fn gate(&self, call: Call) -> Result<bool, RemoteError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            if state.offline {
                return Err(RemoteError::Transient("connection refused".to_string()));
            }
            state.script.pop_front()
        };
        match step {
            None => Ok(false),
            Some(Script::Fail(e)) => Err(e),
            Some(Script::DropResponse) => Ok(true),
            Some(Script::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(false)
            }
        }
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

fn tab_event(id: &str, local_id: Option<LocalId>, tab: &RemoteTab, sequence: u64) -> ChangeEvent {
    ChangeEvent {
        canonical_id: id.to_string(),
        local_id,
        state: RemoteState::Tab(tab.clone()),
        server_sequence: sequence,
    }
}

fn lost_ack() -> RemoteError {
    RemoteError::Transient("connection reset before response".to_string())
}

#[async_trait]
impl RemoteAuthority for MemoryAuthority {
    async fn create_tab(
        &self,
        local_id: &LocalId,
        tenant_id: &str,
        payload: &NewTab,
    ) -> Result<CreatedTab, RemoteError> {
        let drop_ack = self.gate(Call::CreateTab { local_id: *local_id }).await?;

        let (created, event) = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.by_local.get(local_id).cloned() {
                let number = state.tabs.get(&existing).map(|(tab, _)| tab.number);
                (
                    CreatedTab {
                        canonical_id: existing,
                        number,
                    },
                    None,
                )
            } else {
                let id = Self::next_id(&mut state, "tab");
                state.sequence += 1;
                let sequence = state.sequence;
                let tab = RemoteTab {
                    tenant_id: tenant_id.to_string(),
                    number: payload.number,
                    status: TabStatus::Open,
                    total_cents: 0,
                    opened_at: payload.opened_at,
                    closed_at: None,
                };
                let event = tab_event(&id, Some(*local_id), &tab, sequence);
                state.tabs.insert(id.clone(), (tab, sequence));
                state.by_local.insert(*local_id, id.clone());
                (
                    CreatedTab {
                        canonical_id: id,
                        number: Some(payload.number),
                    },
                    Some(event),
                )
            }
        };
        if let Some(event) = event {
            let _ = self.feed.send(event);
        }
        if drop_ack {
            return Err(lost_ack());
        }
        Ok(created)
    }

    async fn add_line_item(
        &self,
        local_id: &LocalId,
        tab_ref: &str,
        payload: &ItemDraft,
    ) -> Result<CreatedLineItem, RemoteError> {
        let drop_ack = self
            .gate(Call::AddLineItem {
                local_id: *local_id,
                tab: tab_ref.to_string(),
            })
            .await?;

        let (created, events) = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.by_local.get(local_id).cloned() {
                (CreatedLineItem { canonical_id: existing }, Vec::new())
            } else {
                match state.tabs.get(tab_ref) {
                    None => return Err(RemoteError::Rejected(format!("no tab {}", tab_ref))),
                    Some((tab, _)) if tab.status != TabStatus::Open => {
                        return Err(RemoteError::Conflict(format!("tab {} is {}", tab_ref, tab.status)))
                    }
                    Some(_) => {}
                }
                let id = Self::next_id(&mut state, "item");
                state.sequence += 1;
                let item_seq = state.sequence;
                state.sequence += 1;
                let tab_seq = state.sequence;
                let item = RemoteLineItem {
                    tab_id: tab_ref.to_string(),
                    description: payload.description.clone(),
                    quantity: payload.quantity,
                    unit_price_cents: payload.unit_price_cents,
                    note: payload.note.clone(),
                    created_at: Utc::now(),
                };
                let item_event = ChangeEvent {
                    canonical_id: id.clone(),
                    local_id: Some(*local_id),
                    state: RemoteState::LineItem(item.clone()),
                    server_sequence: item_seq,
                };
                state.items.insert(id.clone(), item);
                state.by_local.insert(*local_id, id.clone());

                let Some((tab, seq)) = state.tabs.get_mut(tab_ref) else {
                    return Err(RemoteError::Rejected(format!("no tab {}", tab_ref)));
                };
                tab.total_cents += payload.unit_price_cents * i64::from(payload.quantity);
                *seq = tab_seq;
                let tab_changed = tab_event(tab_ref, None, tab, tab_seq);
                (
                    CreatedLineItem { canonical_id: id },
                    vec![item_event, tab_changed],
                )
            }
        };
        for event in events {
            let _ = self.feed.send(event);
        }
        if drop_ack {
            return Err(lost_ack());
        }
        Ok(created)
    }

    async fn close_tab(&self, tab_ref: &str, _payment: &PaymentInfo) -> Result<(), RemoteError> {
        self.gate(Call::CloseTab {
            tab: tab_ref.to_string(),
        })
        .await?;
        self.finish(tab_ref, TabStatus::Closed)
    }

    async fn cancel_tab(&self, tab_ref: &str, _reason: Option<&str>) -> Result<(), RemoteError> {
        self.gate(Call::CancelTab {
            tab: tab_ref.to_string(),
        })
        .await?;
        self.finish(tab_ref, TabStatus::Cancelled)
    }

    async fn fetch_tab(&self, tab_ref: &str) -> Result<FetchedTab, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::FetchTab {
            tab: tab_ref.to_string(),
        });
        match state.tabs.get(tab_ref) {
            Some((tab, seq)) => Ok(FetchedTab {
                canonical_id: tab_ref.to_string(),
                tab: tab.clone(),
                server_sequence: *seq,
            }),
            None => Err(RemoteError::Rejected(format!("no tab {}", tab_ref))),
        }
    }

    async fn subscribe(&self, tenant_id: &str) -> Result<ChangeStream, RemoteError> {
        if self.state.lock().unwrap().offline {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        let tenant = tenant_id.to_string();
        let tabs: HashMap<String, String> = self
            .state
            .lock()
            .unwrap()
            .tabs
            .iter()
            .map(|(id, (tab, _))| (id.clone(), tab.tenant_id.clone()))
            .collect();
        let stream = BroadcastStream::new(self.feed.subscribe()).filter_map(move |next| {
            let keep = match &next {
                Ok(ChangeEvent {
                    state: RemoteState::Tab(tab),
                    ..
                }) => tab.tenant_id == tenant,
                Ok(ChangeEvent {
                    state: RemoteState::LineItem(item),
                    ..
                }) => tabs.get(&item.tab_id).map_or(true, |owner| owner == &tenant),
                Err(_) => false,
            };
            let event = next.ok().filter(|_| keep).map(Ok);
            async move { event }
        });
        Ok(stream.boxed())
    }
}

impl MemoryAuthority {
    fn finish(&self, tab_ref: &str, status: TabStatus) -> Result<(), RemoteError> {
        let event = {
            let mut state = self.state.lock().unwrap();
            state.sequence += 1;
            let sequence = state.sequence;
            let Some((tab, seq)) = state.tabs.get_mut(tab_ref) else {
                return Err(RemoteError::Rejected(format!("no tab {}", tab_ref)));
            };
            if tab.status.is_terminal() {
                return Err(RemoteError::Conflict(format!("tab {} is already {}", tab_ref, tab.status)));
            }
            tab.status = status;
            tab.closed_at = Some(Utc::now());
            *seq = sequence;
            tab_event(tab_ref, None, tab, sequence)
        };
        let _ = self.feed.send(event);
        Ok(())
    }
}

/// Poll `check` until it holds or the deadline passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn draft(description: &str, quantity: u32, unit_price_cents: i64) -> ItemDraft {
    ItemDraft {
        description: description.to_string(),
        quantity,
        unit_price_cents,
        note: None,
    }
}

pub fn payment(amount_cents: i64) -> PaymentInfo {
    PaymentInfo {
        method: "card".to_string(),
        amount_cents,
        tip_cents: 0,
    }
}

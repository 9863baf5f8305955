//! Local Store: durable on-device state for tabs, line items and the sync queue.
//!
//! Uses redb for embedded storage. Tables:
//! - tabs: entity key -> Tab (JSON)
//! - line_items: entity key -> LineItem (JSON)
//! - sync_queue: seq -> QueueEntry (JSON)
//! - deferred_changes: receipt seq -> DeferredChange (JSON)
//! - parked_entries: seq -> ParkedEntry (JSON)
//! - notices: seq -> Notice (JSON)
//! - meta: name -> u64 counters
//!
//! State and queue share one database so an optimistic write and the queue
//! entry describing it always commit in the same write transaction.

pub mod merge;
pub mod notices;
pub mod queue;

use crate::error::StoreError;
use crate::identity::{EntityId, EntityKind, LocalId};
use crate::model::{ItemDraft, LineItem, PaymentInfo, Provenance, Tab, TabStatus};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use merge::{DeferredChange, MergeOutcome};
pub use notices::{Notice, NoticeKind};
pub use queue::{Action, Mutation, ParkedEntry, QueueEntry};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
type SeqTable = TableDefinition<'static, u64, &'static [u8]>;

const TABS: JsonTable = TableDefinition::new("tabs");
const LINE_ITEMS: JsonTable = TableDefinition::new("line_items");
const QUEUE: SeqTable = TableDefinition::new("sync_queue");
const DEFERRED: SeqTable = TableDefinition::new("deferred_changes");
const PARKED: SeqTable = TableDefinition::new("parked_entries");
const NOTICES: SeqTable = TableDefinition::new("notices");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Change announced after a transaction commits.
///
/// These are wake-up hints only; subscribers re-read the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    TabsChanged { tenant_id: String },
    Enqueued { seq: u64 },
    QueueResolved { seq: u64 },
}

/// A subscription to store change notifications.
pub struct StoreSubscription {
    receiver: broadcast::Receiver<StoreEvent>,
}

impl StoreSubscription {
    /// Receive the next notification, waiting if necessary.
    pub async fn recv(&mut self) -> Result<StoreEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

/// Single owner of on-device state. All mutating operations are one redb
/// write transaction each.
pub struct LocalStore {
    db: Database,
    changes: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            txn.open_table(TABS)?;
            txn.open_table(LINE_ITEMS)?;
            txn.open_table(QUEUE)?;
            txn.open_table(DEFERRED)?;
            txn.open_table(PARKED)?;
            txn.open_table(NOTICES)?;
            txn.open_table(META)?;
        }
        txn.commit()?;

        let (changes, _) = broadcast::channel(256);
        Ok(Self { db, changes })
    }

    pub fn subscribe(&self) -> StoreSubscription {
        StoreSubscription {
            receiver: self.changes.subscribe(),
        }
    }

    /// Run `f` inside one write transaction. Nothing is committed if `f` fails.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction, &mut Vec<StoreEvent>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let txn = self.db.begin_write()?;
        let mut events = Vec::new();
        let value = f(&txn, &mut events)?;
        txn.commit()?;
        for event in events {
            let _ = self.changes.send(event);
        }
        Ok(value)
    }

    // --- Optimistic writes from staff actions ---

    /// Open a new tab under a fresh local identity and enqueue its creation.
    pub fn record_open_tab(&self, tenant_id: &str) -> Result<Tab, StoreError> {
        self.write(|txn, events| {
            let local = LocalId::mint();
            let number = next_counter(txn, &tab_number_key(tenant_id))?;
            let opened_at = Utc::now();
            let tab = Tab {
                id: EntityId::Local(local),
                origin: Some(local),
                tenant_id: tenant_id.to_string(),
                number,
                status: TabStatus::Open,
                total_cents: 0,
                opened_at,
                closed_at: None,
                provenance: Provenance::Local,
                server_sequence: None,
            };
            save_tab(txn, &tab)?;
            let seq = queue::enqueue(
                txn,
                tab.id.clone(),
                Mutation::OpenTab {
                    tenant_id: tenant_id.to_string(),
                    number,
                    opened_at,
                },
            )?;
            debug!("Opened tab {} (#{}) as queue entry {}", tab.id, number, seq);
            events.push(StoreEvent::TabsChanged {
                tenant_id: tenant_id.to_string(),
            });
            events.push(StoreEvent::Enqueued { seq });
            Ok(tab)
        })
    }

    /// Add an item to an open tab and enqueue it.
    pub fn record_line_item(
        &self,
        tab_ref: &EntityId,
        draft: ItemDraft,
    ) -> Result<LineItem, StoreError> {
        self.write(|txn, events| {
            let mut tab = require_tab(txn, tab_ref)?;
            if !tab.is_open() {
                return Err(StoreError::InvalidTransition {
                    id: tab.id,
                    status: tab.status,
                    action: "add items",
                });
            }

            let line_total_cents = draft.line_total_cents().ok_or_else(|| {
                StoreError::AmountOverflow(format!(
                    "{} x {} cents",
                    draft.quantity, draft.unit_price_cents
                ))
            })?;
            tab.total_cents = tab
                .total_cents
                .checked_add(line_total_cents)
                .ok_or_else(|| StoreError::AmountOverflow(format!("total of tab {}", tab.id)))?;

            let local = LocalId::mint();
            let item = LineItem {
                id: EntityId::Local(local),
                origin: Some(local),
                tab_id: tab.id.clone(),
                description: draft.description.clone(),
                quantity: draft.quantity,
                unit_price_cents: draft.unit_price_cents,
                line_total_cents,
                note: draft.note.clone(),
                created_at: Utc::now(),
                provenance: Provenance::Local,
                server_sequence: None,
            };
            save_item(txn, &item)?;
            save_tab(txn, &tab)?;

            let seq = queue::enqueue(
                txn,
                item.id.clone(),
                Mutation::AddLineItem {
                    tab: tab.id.clone(),
                    draft,
                },
            )?;
            debug!("Added item {} to tab {} as queue entry {}", item.id, tab.id, seq);
            events.push(StoreEvent::TabsChanged {
                tenant_id: tab.tenant_id,
            });
            events.push(StoreEvent::Enqueued { seq });
            Ok(item)
        })
    }

    /// Close an open tab and enqueue the closure.
    pub fn record_close(&self, tab_ref: &EntityId, payment: PaymentInfo) -> Result<Tab, StoreError> {
        self.record_terminal(tab_ref, TabStatus::Closed, Mutation::CloseTab { payment })
    }

    /// Cancel an open tab and enqueue the cancellation.
    pub fn record_cancel(&self, tab_ref: &EntityId, reason: Option<String>) -> Result<Tab, StoreError> {
        self.record_terminal(tab_ref, TabStatus::Cancelled, Mutation::CancelTab { reason })
    }

    fn record_terminal(
        &self,
        tab_ref: &EntityId,
        status: TabStatus,
        mutation: Mutation,
    ) -> Result<Tab, StoreError> {
        self.write(|txn, events| {
            let mut tab = require_tab(txn, tab_ref)?;
            if !tab.is_open() {
                return Err(StoreError::InvalidTransition {
                    id: tab.id,
                    status: tab.status,
                    action: "close",
                });
            }
            tab.status = status;
            tab.closed_at = Some(Utc::now());
            tab.provenance = Provenance::Local;
            save_tab(txn, &tab)?;

            let seq = queue::enqueue(txn, tab.id.clone(), mutation)?;
            debug!("Tab {} marked {} as queue entry {}", tab.id, status, seq);
            events.push(StoreEvent::TabsChanged {
                tenant_id: tab.tenant_id.clone(),
            });
            events.push(StoreEvent::Enqueued { seq });
            Ok(tab)
        })
    }

    // --- Upserts of authority state ---

    /// Upsert a tab by identity.
    ///
    /// A canonical record whose `origin` still exists under its local key
    /// renames that record (and its dependents) in the same transaction.
    pub fn put_tab(&self, tab: &Tab) -> Result<(), StoreError> {
        self.write(|txn, events| {
            if upsert_tab(txn, tab.clone(), Overwrite::FeedOrder)? {
                events.push(StoreEvent::TabsChanged {
                    tenant_id: tab.tenant_id.clone(),
                });
            }
            Ok(())
        })
    }

    /// Upsert a line item by identity. The owning tab must already exist.
    pub fn put_line_item(&self, item: &LineItem) -> Result<(), StoreError> {
        self.write(|txn, events| {
            if let Some(tenant_id) = upsert_item(txn, item.clone())? {
                events.push(StoreEvent::TabsChanged { tenant_id });
            }
            Ok(())
        })
    }

    /// Rewrite a local identity to its canonical one everywhere it is referenced.
    pub(crate) fn rename_identity(
        &self,
        kind: EntityKind,
        old_id: &LocalId,
        new_id: &str,
    ) -> Result<(), StoreError> {
        self.write(|txn, events| {
            let tenant_id = rename_in_txn(txn, kind, old_id, new_id)?;
            events.push(StoreEvent::TabsChanged { tenant_id });
            Ok(())
        })
    }

    // --- Reads ---

    /// Look up a tab. A local identity that has since been renamed resolves to
    /// the renamed record.
    pub fn get_tab(&self, id: &EntityId) -> Result<Option<Tab>, StoreError> {
        let txn = self.db.begin_read()?;
        let tabs = txn.open_table(TABS)?;
        find_tab(&tabs, id)
    }

    pub fn get_line_item(&self, id: &EntityId) -> Result<Option<LineItem>, StoreError> {
        let txn = self.db.begin_read()?;
        let items = txn.open_table(LINE_ITEMS)?;
        if let Some(item) = read_row::<LineItem>(&items, &id.storage_key())? {
            return Ok(Some(item));
        }
        let Some(local) = id.as_local() else {
            return Ok(None);
        };
        Ok(read_rows::<LineItem>(&items)?
            .into_iter()
            .find(|item| item.origin.as_ref() == Some(local)))
    }

    /// Snapshot of the tenant's open tabs ordered by sequence number.
    pub fn get_open_tabs(&self, tenant_id: &str) -> Result<Vec<Tab>, StoreError> {
        let txn = self.db.begin_read()?;
        let tabs = txn.open_table(TABS)?;
        let mut open: Vec<Tab> = read_rows::<Tab>(&tabs)?
            .into_iter()
            .filter(|tab| tab.tenant_id == tenant_id && tab.is_open())
            .collect();
        open.sort_by(|a, b| a.number.cmp(&b.number).then(a.opened_at.cmp(&b.opened_at)));
        Ok(open)
    }

    /// Items of a tab ordered by creation time.
    pub fn line_items(&self, tab_ref: &EntityId) -> Result<Vec<LineItem>, StoreError> {
        let txn = self.db.begin_read()?;
        let tabs = txn.open_table(TABS)?;
        let tab = find_tab(&tabs, tab_ref)?.ok_or_else(|| StoreError::NotFound {
            kind: EntityKind::Tab,
            id: tab_ref.clone(),
        })?;
        let items = txn.open_table(LINE_ITEMS)?;
        let mut found: Vec<LineItem> = read_rows::<LineItem>(&items)?
            .into_iter()
            .filter(|item| item.tab_id == tab.id)
            .collect();
        found.sort_by_key(|item| item.created_at);
        Ok(found)
    }

    // --- Retention ---

    /// Remove a tab and its line items. Retention policy only; the sync path
    /// never purges. Tabs with queued mutations are refused.
    pub fn purge(&self, tab_id: &EntityId) -> Result<(), StoreError> {
        self.write(|txn, events| {
            let tab = require_tab(txn, tab_id)?;
            if queue::chain_has_entries(txn, &tab)? {
                return Err(StoreError::InvalidTransition {
                    id: tab.id,
                    status: tab.status,
                    action: "purge while mutations are pending",
                });
            }
            purge_in_txn(txn, &tab)?;
            events.push(StoreEvent::TabsChanged {
                tenant_id: tab.tenant_id,
            });
            Ok(())
        })
    }

    /// Purge closed or cancelled tabs of a tenant that settled before `cutoff`
    /// and have nothing left in the queue. Returns how many were removed.
    pub fn purge_settled_before(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.write(|txn, events| {
            let candidates: Vec<Tab> = {
                let tabs = txn.open_table(TABS)?;
                read_rows::<Tab>(&tabs)?
                    .into_iter()
                    .filter(|tab| {
                        tab.tenant_id == tenant_id
                            && tab.status.is_terminal()
                            && tab.closed_at.is_some_and(|at| at < cutoff)
                    })
                    .collect()
            };

            let mut purged = 0;
            for tab in candidates {
                if queue::chain_has_entries(txn, &tab)? {
                    continue;
                }
                purge_in_txn(txn, &tab)?;
                purged += 1;
            }
            if purged > 0 {
                info!("Retention purged {} settled tabs for {}", purged, tenant_id);
                events.push(StoreEvent::TabsChanged {
                    tenant_id: tenant_id.to_string(),
                });
            }
            Ok(purged)
        })
    }
}

/// How authority state is reconciled with an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overwrite {
    /// Feed delivery: deduplicated by server sequence, status never reverses
    FeedOrder,
    /// Reconciliation read after a terminal failure: the authority wins
    Authoritative,
}

fn tab_number_key(tenant_id: &str) -> String {
    format!("tab_number:{}", tenant_id)
}

// --- Row codec helpers ---

fn read_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn read_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Vec<T>, StoreError> {
    let mut rows = Vec::new();
    for row in table.iter()? {
        let (_, value) = row?;
        rows.push(serde_json::from_slice(value.value())?);
    }
    Ok(rows)
}

fn read_seq_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> Result<Vec<(u64, T)>, StoreError> {
    let mut rows = Vec::new();
    for row in table.iter()? {
        let (key, value) = row?;
        rows.push((key.value(), serde_json::from_slice(value.value())?));
    }
    Ok(rows)
}

fn write_row<T: Serialize>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    let mut table = txn.open_table(def)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn write_seq_row<T: Serialize>(
    txn: &WriteTransaction,
    def: SeqTable,
    seq: u64,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    let mut table = txn.open_table(def)?;
    table.insert(seq, bytes.as_slice())?;
    Ok(())
}

fn remove_row(txn: &WriteTransaction, def: JsonTable, key: &str) -> Result<(), StoreError> {
    let mut table = txn.open_table(def)?;
    table.remove(key)?;
    Ok(())
}

fn remove_seq_row(txn: &WriteTransaction, def: SeqTable, seq: u64) -> Result<(), StoreError> {
    let mut table = txn.open_table(def)?;
    table.remove(seq)?;
    Ok(())
}

/// Increment and return a named counter.
fn next_counter(txn: &WriteTransaction, name: &str) -> Result<u64, StoreError> {
    let mut table = txn.open_table(META)?;
    let next = table.get(name)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(name, next)?;
    Ok(next)
}

/// Raise a counter to at least `value`.
fn observe_counter(txn: &WriteTransaction, name: &str, value: u64) -> Result<(), StoreError> {
    let mut table = txn.open_table(META)?;
    let current = table.get(name)?.map(|v| v.value()).unwrap_or(0);
    if value > current {
        table.insert(name, value)?;
    }
    Ok(())
}

// --- Tab and item helpers (write transaction) ---

fn find_tab(
    tabs: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &EntityId,
) -> Result<Option<Tab>, StoreError> {
    if let Some(tab) = read_row::<Tab>(tabs, &id.storage_key())? {
        return Ok(Some(tab));
    }
    let Some(local) = id.as_local() else {
        return Ok(None);
    };
    Ok(read_rows::<Tab>(tabs)?
        .into_iter()
        .find(|tab| tab.origin.as_ref() == Some(local)))
}

pub(crate) fn load_tab(txn: &WriteTransaction, id: &EntityId) -> Result<Option<Tab>, StoreError> {
    let tabs = txn.open_table(TABS)?;
    find_tab(&tabs, id)
}

fn require_tab(txn: &WriteTransaction, id: &EntityId) -> Result<Tab, StoreError> {
    load_tab(txn, id)?.ok_or_else(|| StoreError::NotFound {
        kind: EntityKind::Tab,
        id: id.clone(),
    })
}

pub(crate) fn save_tab(txn: &WriteTransaction, tab: &Tab) -> Result<(), StoreError> {
    write_row(txn, TABS, &tab.id.storage_key(), tab)
}

pub(crate) fn load_item(txn: &WriteTransaction, id: &EntityId) -> Result<Option<LineItem>, StoreError> {
    let items = txn.open_table(LINE_ITEMS)?;
    read_row(&items, &id.storage_key())
}

pub(crate) fn save_item(txn: &WriteTransaction, item: &LineItem) -> Result<(), StoreError> {
    write_row(txn, LINE_ITEMS, &item.id.storage_key(), item)
}

fn items_of(txn: &WriteTransaction, tab_id: &EntityId) -> Result<Vec<LineItem>, StoreError> {
    let items = txn.open_table(LINE_ITEMS)?;
    Ok(read_rows::<LineItem>(&items)?
        .into_iter()
        .filter(|item| &item.tab_id == tab_id)
        .collect())
}

fn purge_in_txn(txn: &WriteTransaction, tab: &Tab) -> Result<(), StoreError> {
    for item in items_of(txn, &tab.id)? {
        remove_row(txn, LINE_ITEMS, &item.id.storage_key())?;
    }
    remove_row(txn, TABS, &tab.id.storage_key())?;
    debug!("Purged tab {}", tab.id);
    Ok(())
}

/// Rename a record from its local to its canonical identity, rewriting every
/// reference to it: dependent line items and queue entries. Returns the tenant
/// of the affected tab.
pub(crate) fn rename_in_txn(
    txn: &WriteTransaction,
    kind: EntityKind,
    old_id: &LocalId,
    new_id: &str,
) -> Result<String, StoreError> {
    let old = EntityId::Local(*old_id);
    let new = EntityId::Canonical(new_id.to_string());

    let tenant_id = match kind {
        EntityKind::Tab => {
            let mut tab = {
                let tabs = txn.open_table(TABS)?;
                read_row::<Tab>(&tabs, &old.storage_key())?
            }
            .ok_or_else(|| StoreError::MissingRecord(format!("rename of unknown tab {}", old)))?;

            remove_row(txn, TABS, &old.storage_key())?;
            if let Some(existing) = load_tab(txn, &new)? {
                tab.server_sequence = tab.server_sequence.max(existing.server_sequence);
            }
            tab.id = new.clone();
            tab.origin = Some(*old_id);
            save_tab(txn, &tab)?;

            let dependents = items_of(txn, &old)?;
            let count = dependents.len();
            for mut item in dependents {
                item.tab_id = new.clone();
                save_item(txn, &item)?;
            }
            info!("Renamed tab {} -> {} ({} line items)", old, new, count);
            tab.tenant_id
        }
        EntityKind::LineItem => {
            let mut item = {
                let items = txn.open_table(LINE_ITEMS)?;
                read_row::<LineItem>(&items, &old.storage_key())?
            }
            .ok_or_else(|| StoreError::MissingRecord(format!("rename of unknown line item {}", old)))?;

            remove_row(txn, LINE_ITEMS, &old.storage_key())?;
            item.id = new.clone();
            item.origin = Some(*old_id);
            save_item(txn, &item)?;
            info!("Renamed line item {} -> {}", old, new);
            require_tab(txn, &item.tab_id)?.tenant_id
        }
    };

    queue::rewrite_identity(txn, &old, &new)?;
    Ok(tenant_id)
}

/// Upsert a tab. Returns whether anything was written.
pub(crate) fn upsert_tab(
    txn: &WriteTransaction,
    mut incoming: Tab,
    mode: Overwrite,
) -> Result<bool, StoreError> {
    if let (EntityId::Canonical(canonical), Some(origin)) = (&incoming.id, incoming.origin) {
        let under_local = {
            let tabs = txn.open_table(TABS)?;
            read_row::<Tab>(&tabs, &EntityId::Local(origin).storage_key())?
        };
        if under_local.is_some() {
            rename_in_txn(txn, EntityKind::Tab, &origin, canonical)?;
        }
    }

    if let Some(existing) = load_tab(txn, &incoming.id)? {
        if mode == Overwrite::FeedOrder {
            if let (Some(seen), Some(seq)) = (existing.server_sequence, incoming.server_sequence) {
                if seq <= seen {
                    debug!("Skipping stale state for tab {} (seq {} <= {})", incoming.id, seq, seen);
                    return Ok(false);
                }
            }
            if existing.status.is_terminal() && !incoming.status.is_terminal() {
                incoming.status = existing.status;
                incoming.closed_at = existing.closed_at;
            }
        }
        if incoming.origin.is_none() {
            incoming.origin = existing.origin;
        }
    }

    observe_counter(txn, &tab_number_key(&incoming.tenant_id), incoming.number)?;
    save_tab(txn, &incoming)?;
    Ok(true)
}

/// Upsert a line item. Returns the tenant of the owning tab when written.
pub(crate) fn upsert_item(
    txn: &WriteTransaction,
    mut incoming: LineItem,
) -> Result<Option<String>, StoreError> {
    let Some(tab) = load_tab(txn, &incoming.tab_id)? else {
        return Err(StoreError::OrphanLineItem {
            item: incoming.id,
            tab: incoming.tab_id,
        });
    };
    incoming.tab_id = tab.id.clone();

    if let (EntityId::Canonical(canonical), Some(origin)) = (&incoming.id, incoming.origin) {
        if load_item(txn, &EntityId::Local(origin))?.is_some() {
            rename_in_txn(txn, EntityKind::LineItem, &origin, canonical)?;
        }
    }

    if let Some(existing) = load_item(txn, &incoming.id)? {
        if let (Some(seen), Some(seq)) = (existing.server_sequence, incoming.server_sequence) {
            if seq <= seen {
                debug!("Skipping stale state for item {} (seq {} <= {})", incoming.id, seq, seen);
                return Ok(None);
            }
        }
        if incoming.origin.is_none() {
            incoming.origin = existing.origin;
        }
    }

    save_item(txn, &incoming)?;
    Ok(Some(tab.tenant_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("device.redb")).unwrap();
        (dir, store)
    }

    fn draft(description: &str, quantity: u32, price: i64) -> ItemDraft {
        ItemDraft {
            description: description.to_string(),
            quantity,
            unit_price_cents: price,
            note: None,
        }
    }

    #[test]
    fn test_open_tab_writes_tab_and_queue_entry() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("bar-do-ze").unwrap();

        assert!(tab.id.is_local());
        assert_eq!(tab.number, 1);
        assert_eq!(store.get_open_tabs("bar-do-ze").unwrap(), vec![tab.clone()]);
        assert_eq!(store.pending_sync_count().unwrap(), 1);

        let second = store.record_open_tab("bar-do-ze").unwrap();
        assert_eq!(second.number, 2);
    }

    #[test]
    fn test_aborted_transaction_leaves_no_trace() {
        let (_dir, store) = open_store();

        let result: Result<(), StoreError> = store.write(|txn, _| {
            let local = LocalId::mint();
            let tab = Tab {
                id: EntityId::Local(local),
                origin: Some(local),
                tenant_id: "t".to_string(),
                number: 1,
                status: TabStatus::Open,
                total_cents: 0,
                opened_at: Utc::now(),
                closed_at: None,
                provenance: Provenance::Local,
                server_sequence: None,
            };
            save_tab(txn, &tab)?;
            // Dies between the state write and the enqueue
            Err(StoreError::MissingRecord("simulated crash".to_string()))
        });

        assert!(result.is_err());
        assert!(store.get_open_tabs("t").unwrap().is_empty());
        assert_eq!(store.pending_sync_count().unwrap(), 0);
    }

    #[test]
    fn test_state_and_queue_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.redb");
        let tab_id = {
            let store = LocalStore::open(&path).unwrap();
            let tab = store.record_open_tab("t").unwrap();
            store.record_line_item(&tab.id, draft("Pastel", 2, 800)).unwrap();
            tab.id
        };

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.line_items(&tab_id).unwrap().len(), 1);
        assert_eq!(store.pending_sync_count().unwrap(), 2);
        assert_eq!(store.get_tab(&tab_id).unwrap().unwrap().total_cents, 1600);
    }

    #[test]
    fn test_rename_rewrites_dependents_and_queue() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("t").unwrap();
        for i in 0..3 {
            store
                .record_line_item(&tab.id, draft(&format!("item {}", i), 1, 500))
                .unwrap();
        }
        let local = *tab.id.as_local().unwrap();

        store.rename_identity(EntityKind::Tab, &local, "tab-100").unwrap();

        let canonical = EntityId::Canonical("tab-100".to_string());
        let items = store.line_items(&canonical).unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.tab_id == canonical));

        let entries = store.queue_entries().unwrap();
        assert!(entries.iter().all(|entry| entry.chain() == &canonical));
        assert!(!entries.iter().any(|entry| entry.target == tab.id));

        // The stale local reference still resolves to the renamed record
        let resolved = store.get_tab(&tab.id).unwrap().unwrap();
        assert_eq!(resolved.id, canonical);
        assert_eq!(resolved.origin, Some(local));
    }

    #[test]
    fn test_rename_of_missing_record_is_invariant_violation() {
        let (_dir, store) = open_store();
        let err = store
            .rename_identity(EntityKind::Tab, &LocalId::mint(), "x")
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingRecord(_)));
    }

    #[test]
    fn test_put_tab_with_origin_is_rename() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("t").unwrap();
        store.record_line_item(&tab.id, draft("Agua", 1, 400)).unwrap();

        let mut canonical = tab.clone();
        canonical.id = EntityId::Canonical("srv-1".to_string());
        canonical.provenance = Provenance::Confirmed;
        store.put_tab(&canonical).unwrap();

        assert_eq!(store.get_open_tabs("t").unwrap().len(), 1);
        let items = store.line_items(&canonical.id).unwrap();
        assert_eq!(items[0].tab_id, canonical.id);
    }

    #[test]
    fn test_status_never_reverses_on_feed_order() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("t").unwrap();
        let payment = PaymentInfo {
            method: "pix".to_string(),
            amount_cents: 0,
            tip_cents: 0,
        };
        store.record_close(&tab.id, payment.clone()).unwrap();

        let mut stale = tab.clone();
        stale.status = TabStatus::Open;
        store.put_tab(&stale).unwrap();
        assert_eq!(
            store.get_tab(&tab.id).unwrap().unwrap().status,
            TabStatus::Closed
        );

        let err = store.record_close(&tab.id, payment).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_add_item_to_closed_tab_is_refused() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("t").unwrap();
        store.record_cancel(&tab.id, None).unwrap();

        let err = store.record_line_item(&tab.id, draft("Cafe", 1, 500)).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(store.pending_sync_count().unwrap(), 2);
    }

    #[test]
    fn test_put_line_item_requires_tab() {
        let (_dir, store) = open_store();
        let item = LineItem {
            id: EntityId::Canonical("item-1".to_string()),
            origin: None,
            tab_id: EntityId::Canonical("nowhere".to_string()),
            description: "Suco".to_string(),
            quantity: 1,
            unit_price_cents: 900,
            line_total_cents: 900,
            note: None,
            created_at: Utc::now(),
            provenance: Provenance::Confirmed,
            server_sequence: Some(1),
        };
        let err = store.put_line_item(&item).unwrap_err();
        assert!(matches!(err, StoreError::OrphanLineItem { .. }));
    }

    #[test]
    fn test_purge_refuses_pending_chain() {
        let (_dir, store) = open_store();
        let tab = store.record_open_tab("t").unwrap();
        assert!(store.purge(&tab.id).is_err());

        let seq = store.queue_entries().unwrap()[0].seq;
        store.mark_succeeded(seq).unwrap();
        store.purge(&tab.id).unwrap();
        assert!(store.get_tab(&tab.id).unwrap().is_none());
    }

    #[test]
    fn test_purge_settled_before() {
        let (_dir, store) = open_store();
        let kept = store.record_open_tab("t").unwrap();
        let settled = store.record_open_tab("t").unwrap();
        store.record_cancel(&settled.id, Some("duplicate".to_string())).unwrap();
        for entry in store.queue_entries().unwrap() {
            store.mark_succeeded(entry.seq).unwrap();
        }

        let purged = store
            .purge_settled_before("t", Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_tab(&kept.id).unwrap().is_some());
        assert!(store.get_tab(&settled.id).unwrap().is_none());
    }
}

//! Sync Queue: the durable, ordered log of what the device still owes the
//! authority. It is also the recovery log: after a restart the engine simply
//! drains it again.

use super::notices::{push_notice, NoticeKind};
use super::{
    items_of, load_item, load_tab, next_counter, read_seq_rows, remove_seq_row, rename_in_txn,
    save_item, save_tab, upsert_tab, write_seq_row, LocalStore, Overwrite, StoreEvent, PARKED,
    QUEUE,
};
use crate::error::StoreError;
use crate::identity::{EntityId, EntityKind};
use crate::model::{ItemDraft, PaymentInfo, Provenance, Tab, TabStatus};
use crate::remote::FetchedTab;
use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
}

/// Snapshot of the mutation to replay against the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    OpenTab {
        tenant_id: String,
        number: u64,
        opened_at: DateTime<Utc>,
    },
    AddLineItem {
        tab: EntityId,
        draft: ItemDraft,
    },
    CloseTab {
        payment: PaymentInfo,
    },
    CancelTab {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Mutation {
    pub fn kind(&self) -> EntityKind {
        match self {
            Mutation::AddLineItem { .. } => EntityKind::LineItem,
            _ => EntityKind::Tab,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Mutation::OpenTab { .. } | Mutation::AddLineItem { .. } => Action::Create,
            Mutation::CloseTab { .. } | Mutation::CancelTab { .. } => Action::Update,
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Insertion sequence; defines replay order
    pub seq: u64,
    /// Record the mutation targets
    pub target: EntityId,
    pub mutation: Mutation,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn kind(&self) -> EntityKind {
        self.mutation.kind()
    }

    pub fn action(&self) -> Action {
        self.mutation.action()
    }

    /// The tab whose dependency chain this entry belongs to. A tab's own
    /// entries and its line items' entries replay strictly in order.
    pub fn chain(&self) -> &EntityId {
        match &self.mutation {
            Mutation::AddLineItem { tab, .. } => tab,
            _ => &self.target,
        }
    }

    /// Rewrite every reference to `old`. Returns whether anything changed.
    fn rewrite_identity(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = false;
        if &self.target == old {
            self.target = new.clone();
            changed = true;
        }
        if let Mutation::AddLineItem { tab, .. } = &mut self.mutation {
            if tab == old {
                *tab = new.clone();
                changed = true;
            }
        }
        changed
    }
}

/// An entry pulled out of the queue because an invariant did not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedEntry {
    pub entry: QueueEntry,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
}

/// Append a mutation. Only callable inside the write transaction that carries
/// the optimistic state change it describes.
pub(crate) fn enqueue(
    txn: &WriteTransaction,
    target: EntityId,
    mutation: Mutation,
) -> Result<u64, StoreError> {
    let seq = next_counter(txn, "queue_seq")?;
    let entry = QueueEntry {
        seq,
        target,
        mutation,
        attempts: 0,
        last_error: None,
        enqueued_at: Utc::now(),
    };
    write_seq_row(txn, QUEUE, seq, &entry)?;
    Ok(seq)
}

pub(crate) fn entries_in(txn: &WriteTransaction) -> Result<Vec<QueueEntry>, StoreError> {
    let table = txn.open_table(QUEUE)?;
    Ok(read_seq_rows::<QueueEntry>(&table)?
        .into_iter()
        .map(|(_, entry)| entry)
        .collect())
}

fn load_entry(txn: &WriteTransaction, seq: u64) -> Result<QueueEntry, StoreError> {
    let table = txn.open_table(QUEUE)?;
    let entry = match table.get(seq)? {
        Some(guard) => serde_json::from_slice(guard.value())?,
        None => return Err(StoreError::UnknownEntry(seq)),
    };
    Ok(entry)
}

/// Rewrite queue references from a local identity to its canonical one.
pub(crate) fn rewrite_identity(
    txn: &WriteTransaction,
    old: &EntityId,
    new: &EntityId,
) -> Result<(), StoreError> {
    for mut entry in entries_in(txn)? {
        if entry.rewrite_identity(old, new) {
            write_seq_row(txn, QUEUE, entry.seq, &entry)?;
        }
    }
    Ok(())
}

/// True if any entry belongs to one of the given chains.
pub(crate) fn chain_blocked(txn: &WriteTransaction, chains: &[EntityId]) -> Result<bool, StoreError> {
    Ok(entries_in(txn)?
        .iter()
        .any(|entry| chains.contains(entry.chain())))
}

pub(crate) fn chain_has_entries(txn: &WriteTransaction, tab: &Tab) -> Result<bool, StoreError> {
    let mut chains = vec![tab.id.clone()];
    if let Some(origin) = tab.origin {
        chains.push(EntityId::Local(origin));
    }
    chain_blocked(txn, &chains)
}

/// Pick the head of each chain, lowest sequence first.
fn chain_heads(entries: Vec<QueueEntry>, limit: usize) -> Vec<QueueEntry> {
    let mut seen = HashSet::new();
    let mut heads = Vec::new();
    for entry in entries {
        if heads.len() >= limit {
            break;
        }
        if seen.insert(entry.chain().clone()) {
            heads.push(entry);
        }
    }
    heads
}

impl LocalStore {
    /// All pending entries in replay order.
    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUEUE)?;
        Ok(read_seq_rows::<QueueEntry>(&table)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// The lowest-sequence entry whose chain has nothing ahead of it.
    pub fn peek_next_ready(&self) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.ready_heads(1)?.into_iter().next())
    }

    /// Up to `limit` entries that may be in flight at the same time: the head
    /// of each dependency chain.
    pub fn ready_heads(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(chain_heads(self.queue_entries()?, limit))
    }

    pub fn pending_sync_count(&self) -> Result<usize, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUEUE)?;
        let mut count = 0;
        for row in table.iter()? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    /// Highest attempt count among pending entries, with its last error.
    pub fn max_attempts(&self) -> Result<Option<(u32, Option<String>)>, StoreError> {
        Ok(self
            .queue_entries()?
            .into_iter()
            .max_by_key(|entry| entry.attempts)
            .map(|entry| (entry.attempts, entry.last_error)))
    }

    /// Remove an acknowledged entry.
    pub fn mark_succeeded(&self, seq: u64) -> Result<(), StoreError> {
        self.write(|txn, events| {
            load_entry(txn, seq)?;
            remove_seq_row(txn, QUEUE, seq)?;
            events.push(StoreEvent::QueueResolved { seq });
            Ok(())
        })
    }

    /// Record a transient failure. The entry stays at the head of its chain.
    pub fn mark_failed(&self, seq: u64, reason: &str) -> Result<u32, StoreError> {
        self.write(|txn, _| {
            let mut entry = load_entry(txn, seq)?;
            entry.attempts += 1;
            entry.last_error = Some(reason.to_string());
            write_seq_row(txn, QUEUE, seq, &entry)?;
            Ok(entry.attempts)
        })
    }

    /// Acknowledged create: rename the record to its canonical identity,
    /// confirm it, and remove the entry, all in one transaction.
    pub fn complete_create(
        &self,
        seq: u64,
        canonical_id: &str,
        number: Option<u64>,
    ) -> Result<(), StoreError> {
        self.write(|txn, events| {
            let entry = load_entry(txn, seq)?;
            let Some(local) = entry.target.as_local().copied() else {
                return Err(StoreError::MissingRecord(format!(
                    "create entry {} targets canonical {}",
                    seq, entry.target
                )));
            };

            let tenant_id = rename_in_txn(txn, entry.kind(), &local, canonical_id)?;
            let renamed = EntityId::Canonical(canonical_id.to_string());
            match entry.kind() {
                EntityKind::Tab => {
                    if let Some(mut tab) = load_tab(txn, &renamed)? {
                        tab.provenance = Provenance::Confirmed;
                        if let Some(number) = number {
                            tab.number = number;
                        }
                        save_tab(txn, &tab)?;
                    }
                }
                EntityKind::LineItem => {
                    if let Some(mut item) = load_item(txn, &renamed)? {
                        item.provenance = Provenance::Confirmed;
                        save_item(txn, &item)?;
                    }
                }
            }

            remove_seq_row(txn, QUEUE, seq)?;
            events.push(StoreEvent::TabsChanged { tenant_id });
            events.push(StoreEvent::QueueResolved { seq });
            Ok(())
        })
    }

    /// Acknowledged update: remove the entry and confirm the tab.
    pub fn complete_update(&self, seq: u64) -> Result<(), StoreError> {
        self.write(|txn, events| {
            let entry = load_entry(txn, seq)?;
            remove_seq_row(txn, QUEUE, seq)?;
            if let Some(mut tab) = load_tab(txn, &entry.target)? {
                if !chain_has_entries(txn, &tab)? {
                    tab.provenance = Provenance::Confirmed;
                    save_tab(txn, &tab)?;
                }
                events.push(StoreEvent::TabsChanged {
                    tenant_id: tab.tenant_id,
                });
            }
            events.push(StoreEvent::QueueResolved { seq });
            Ok(())
        })
    }

    /// Move an entry out of the queue because it can never be sent as is.
    /// It is kept in `parked_entries` with a notice, never dropped.
    pub fn park(&self, seq: u64, reason: &str) -> Result<(), StoreError> {
        self.write(|txn, events| {
            let entry = load_entry(txn, seq)?;
            warn!("[sync] Parking queue entry {} ({}): {}", seq, entry.target, reason);
            remove_seq_row(txn, QUEUE, seq)?;
            push_notice(
                txn,
                NoticeKind::EntryParked,
                entry.target.clone(),
                format!("A pending change could not be synced and was set aside: {}", reason),
            )?;
            let parked = ParkedEntry {
                entry,
                reason: reason.to_string(),
                parked_at: Utc::now(),
            };
            write_seq_row(txn, PARKED, seq, &parked)?;
            events.push(StoreEvent::QueueResolved { seq });
            Ok(())
        })
    }

    pub fn parked_entries(&self) -> Result<Vec<ParkedEntry>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PARKED)?;
        Ok(read_seq_rows::<ParkedEntry>(&table)?
            .into_iter()
            .map(|(_, parked)| parked)
            .collect())
    }

    /// Resolve an entry the authority refused for good.
    ///
    /// The optimistic local value is overridden: by `reconciled` when the
    /// reconciliation read succeeded, otherwise by marking what could not be
    /// sent as rejected. A rejected tab creation takes the rest of its chain
    /// with it. Returns the sequences removed from the queue.
    pub fn resolve_terminal(
        &self,
        seq: u64,
        reason: &str,
        reconciled: Option<&FetchedTab>,
    ) -> Result<Vec<u64>, StoreError> {
        self.write(|txn, events| {
            let entry = load_entry(txn, seq)?;
            let mut removed = vec![seq];
            remove_seq_row(txn, QUEUE, seq)?;

            match &entry.mutation {
                Mutation::OpenTab { .. } => {
                    for later in entries_in(txn)? {
                        if later.chain() == entry.chain() {
                            remove_seq_row(txn, QUEUE, later.seq)?;
                            removed.push(later.seq);
                        }
                    }
                    if let Some(mut tab) = load_tab(txn, &entry.target)? {
                        tab.provenance = Provenance::Rejected;
                        tab.status = TabStatus::Cancelled;
                        tab.closed_at.get_or_insert_with(Utc::now);
                        save_tab(txn, &tab)?;
                        for mut item in items_of(txn, &tab.id)? {
                            if item.provenance == Provenance::Local {
                                item.provenance = Provenance::Rejected;
                                save_item(txn, &item)?;
                            }
                        }
                        push_notice(
                            txn,
                            NoticeKind::TabRejected,
                            tab.id.clone(),
                            format!("Tab #{} was refused by the server: {}", tab.number, reason),
                        )?;
                        events.push(StoreEvent::TabsChanged {
                            tenant_id: tab.tenant_id,
                        });
                    }
                }
                Mutation::AddLineItem { tab, .. } => {
                    if let Some(mut item) = load_item(txn, &entry.target)? {
                        item.provenance = Provenance::Rejected;
                        save_item(txn, &item)?;
                        if let Some(mut owner) = load_tab(txn, tab)? {
                            owner.total_cents = owner.total_cents.saturating_sub(item.line_total_cents);
                            save_tab(txn, &owner)?;
                            events.push(StoreEvent::TabsChanged {
                                tenant_id: owner.tenant_id,
                            });
                        }
                        push_notice(
                            txn,
                            NoticeKind::ItemUnsendable,
                            item.id.clone(),
                            format!(
                                "{} x{} could not be added to the tab: {}",
                                item.description, item.quantity, reason
                            ),
                        )?;
                    }
                }
                Mutation::CloseTab { .. } | Mutation::CancelTab { .. } => {
                    let kind = if reconciled.is_some_and(|fetched| fetched.tab.status.is_terminal()) {
                        NoticeKind::TabClosedElsewhere
                    } else {
                        NoticeKind::UpdateRejected
                    };
                    let message = match kind {
                        NoticeKind::TabClosedElsewhere => {
                            "This tab was already closed on another device".to_string()
                        }
                        _ => format!("Closing the tab was refused: {}", reason),
                    };
                    push_notice(txn, kind, entry.target.clone(), message)?;
                }
            }

            if let Some(fetched) = reconciled {
                let origin = load_tab(txn, entry.chain())?.and_then(|tab| tab.origin);
                let tab = fetched_to_tab(fetched, origin);
                info!(
                    "[sync] Reconciled tab {} from authority ({})",
                    tab.id, tab.status
                );
                events.push(StoreEvent::TabsChanged {
                    tenant_id: tab.tenant_id.clone(),
                });
                upsert_tab(txn, tab, Overwrite::Authoritative)?;
            }

            debug!("[sync] Terminal failure resolved entries {:?}", removed);
            for seq in &removed {
                events.push(StoreEvent::QueueResolved { seq: *seq });
            }
            Ok(removed)
        })
    }
}

fn fetched_to_tab(fetched: &FetchedTab, origin: Option<crate::identity::LocalId>) -> Tab {
    Tab {
        id: EntityId::Canonical(fetched.canonical_id.clone()),
        origin,
        tenant_id: fetched.tab.tenant_id.clone(),
        number: fetched.tab.number,
        status: fetched.tab.status,
        total_cents: fetched.tab.total_cents,
        opened_at: fetched.tab.opened_at,
        closed_at: fetched.tab.closed_at,
        provenance: Provenance::Confirmed,
        server_sequence: Some(fetched.server_sequence),
    }
}

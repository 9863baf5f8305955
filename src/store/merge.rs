//! Folding authority change events into the Local Store.
//!
//! An event whose tab chain still has queue entries is deferred: appended to
//! `deferred_changes` in receipt order. Deferred events replay, exactly once,
//! when their chain clears. Checking, applying and deferring each happen in
//! one write transaction, so they cannot interleave with an engine write.

use super::queue::chain_blocked;
use super::{
    load_tab, next_counter, read_seq_rows, remove_seq_row, upsert_item, upsert_tab,
    write_seq_row, LocalStore, Overwrite, StoreEvent, DEFERRED,
};
use crate::error::StoreError;
use crate::identity::EntityId;
use crate::model::{LineItem, Provenance, Tab};
use crate::remote::{ChangeEvent, RemoteState};
use chrono::{DateTime, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Already seen (at-least-once redelivery or older state)
    Duplicate,
    Deferred,
    /// Unusable state (amounts out of range); logged and dropped
    Discarded,
}

/// A change event waiting for its chain to clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredChange {
    /// Canonical id of the owning tab
    pub chain: String,
    pub event: ChangeEvent,
    pub received_at: DateTime<Utc>,
}

impl LocalStore {
    /// Apply one feed event, or defer it behind pending local work.
    pub fn apply_change(&self, event: &ChangeEvent) -> Result<MergeOutcome, StoreError> {
        self.write(|txn, events| {
            let chain = event.chain_id().to_string();
            if is_blocked(txn, event)? || has_deferred(txn, &chain)? {
                defer(txn, event)?;
                return Ok(MergeOutcome::Deferred);
            }
            match apply_event(txn, event) {
                Ok(Some(tenant_id)) => {
                    events.push(StoreEvent::TabsChanged { tenant_id });
                    Ok(MergeOutcome::Applied)
                }
                Ok(None) => Ok(MergeOutcome::Duplicate),
                Err(StoreError::OrphanLineItem { .. }) => {
                    debug!("[merge] Item {} arrived before tab {}", event.canonical_id, chain);
                    defer(txn, event)?;
                    Ok(MergeOutcome::Deferred)
                }
                Err(StoreError::AmountOverflow(detail)) => {
                    warn!(
                        "[merge] Dropping {} {}: {}",
                        event.entity_kind(),
                        event.canonical_id,
                        detail
                    );
                    Ok(MergeOutcome::Discarded)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Replay deferred events of every chain that is no longer blocked, in
    /// receipt order. An item that still has no tab stays deferred while the
    /// rest of its chain moves on. Returns how many were applied (duplicates
    /// included).
    pub fn apply_ready_deferred(&self) -> Result<usize, StoreError> {
        self.write(|txn, events| {
            let mut pending: Vec<(u64, DeferredChange)> = {
                let table = txn.open_table(DEFERRED)?;
                read_seq_rows(&table)?
            };

            let mut replayed = 0;
            loop {
                let mut held: HashSet<String> = HashSet::new();
                let mut waiting = Vec::new();
                let before = replayed;
                for (seq, deferred) in pending {
                    if held.contains(&deferred.chain) || is_blocked(txn, &deferred.event)? {
                        held.insert(deferred.chain.clone());
                        waiting.push((seq, deferred));
                        continue;
                    }
                    match apply_event(txn, &deferred.event) {
                        Ok(tenant) => {
                            remove_seq_row(txn, DEFERRED, seq)?;
                            replayed += 1;
                            if let Some(tenant_id) = tenant {
                                events.push(StoreEvent::TabsChanged { tenant_id });
                            }
                        }
                        Err(StoreError::OrphanLineItem { .. }) => waiting.push((seq, deferred)),
                        Err(StoreError::AmountOverflow(detail)) => {
                            warn!(
                                "[merge] Dropping deferred {} {}: {}",
                                deferred.event.entity_kind(),
                                deferred.event.canonical_id,
                                detail
                            );
                            remove_seq_row(txn, DEFERRED, seq)?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                pending = waiting;
                if replayed == before || pending.is_empty() {
                    break;
                }
            }
            if replayed > 0 {
                debug!("[merge] Replayed {} deferred changes", replayed);
            }
            Ok(replayed)
        })
    }

    pub fn deferred_changes(&self) -> Result<Vec<DeferredChange>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEFERRED)?;
        Ok(read_seq_rows::<DeferredChange>(&table)?
            .into_iter()
            .map(|(_, deferred)| deferred)
            .collect())
    }
}

/// Whether the event's tab chain has queue entries, under its canonical id
/// or the local id it was created with.
fn is_blocked(txn: &WriteTransaction, event: &ChangeEvent) -> Result<bool, StoreError> {
    let canonical = EntityId::Canonical(event.chain_id().to_string());
    let mut chains = vec![canonical.clone()];
    if let (RemoteState::Tab(_), Some(local)) = (&event.state, event.local_id) {
        chains.push(EntityId::Local(local));
    }
    if let Some(origin) = load_tab(txn, &canonical)?.and_then(|tab| tab.origin) {
        chains.push(EntityId::Local(origin));
    }
    chain_blocked(txn, &chains)
}

fn has_deferred(txn: &WriteTransaction, chain: &str) -> Result<bool, StoreError> {
    let table = txn.open_table(DEFERRED)?;
    Ok(read_seq_rows::<DeferredChange>(&table)?
        .iter()
        .any(|(_, deferred)| deferred.chain == chain))
}

fn defer(txn: &WriteTransaction, event: &ChangeEvent) -> Result<(), StoreError> {
    let seq = next_counter(txn, "deferred_seq")?;
    let deferred = DeferredChange {
        chain: event.chain_id().to_string(),
        event: event.clone(),
        received_at: Utc::now(),
    };
    debug!(
        "[merge] Deferring {} {} (seq {}) behind pending work",
        event.entity_kind(),
        event.canonical_id,
        event.server_sequence
    );
    write_seq_row(txn, DEFERRED, seq, &deferred)
}

/// Write the event's state. Returns the tenant when something changed.
fn apply_event(txn: &WriteTransaction, event: &ChangeEvent) -> Result<Option<String>, StoreError> {
    let id = EntityId::Canonical(event.canonical_id.clone());
    match &event.state {
        RemoteState::Tab(remote) => {
            let tab = Tab {
                id,
                origin: event.local_id,
                tenant_id: remote.tenant_id.clone(),
                number: remote.number,
                status: remote.status,
                total_cents: remote.total_cents,
                opened_at: remote.opened_at,
                closed_at: remote.closed_at,
                provenance: Provenance::Confirmed,
                server_sequence: Some(event.server_sequence),
            };
            let tenant_id = tab.tenant_id.clone();
            Ok(upsert_tab(txn, tab, Overwrite::FeedOrder)?.then_some(tenant_id))
        }
        RemoteState::LineItem(remote) => {
            let line_total_cents = remote
                .unit_price_cents
                .checked_mul(i64::from(remote.quantity))
                .ok_or_else(|| {
                    StoreError::AmountOverflow(format!(
                        "{} x {} cents",
                        remote.quantity, remote.unit_price_cents
                    ))
                })?;
            let item = LineItem {
                id,
                origin: event.local_id,
                tab_id: EntityId::Canonical(remote.tab_id.clone()),
                description: remote.description.clone(),
                quantity: remote.quantity,
                unit_price_cents: remote.unit_price_cents,
                line_total_cents,
                note: remote.note.clone(),
                created_at: remote.created_at,
                provenance: Provenance::Confirmed,
                server_sequence: Some(event.server_sequence),
            };
            upsert_item(txn, item)
        }
    }
}

//! Durable reconciliation notices shown to staff.

use super::{read_seq_rows, remove_seq_row, next_counter, write_seq_row, LocalStore, NOTICES};
use crate::error::StoreError;
use crate::identity::EntityId;
use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A close/cancel lost the race against another device
    TabClosedElsewhere,
    /// A line item the authority refused; kept locally, flagged rejected
    ItemUnsendable,
    /// A tab whose creation the authority refused
    TabRejected,
    /// A close/cancel refused for a reason other than a prior closure
    UpdateRejected,
    /// A queue entry set aside after an invariant violation
    EntryParked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub seq: u64,
    pub kind: NoticeKind,
    pub entity: EntityId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn push_notice(
    txn: &WriteTransaction,
    kind: NoticeKind,
    entity: EntityId,
    message: String,
) -> Result<u64, StoreError> {
    let seq = next_counter(txn, "notice_seq")?;
    let notice = Notice {
        seq,
        kind,
        entity,
        message,
        created_at: Utc::now(),
    };
    tracing::info!("[sync] Notice {:?} for {}: {}", notice.kind, notice.entity, notice.message);
    write_seq_row(txn, NOTICES, seq, &notice)?;
    Ok(seq)
}

impl LocalStore {
    /// Outstanding notices, oldest first.
    pub fn notices(&self) -> Result<Vec<Notice>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(NOTICES)?;
        Ok(read_seq_rows::<Notice>(&table)?
            .into_iter()
            .map(|(_, notice)| notice)
            .collect())
    }

    /// Remove a notice once staff acknowledged it. Returns false if unknown.
    pub fn dismiss_notice(&self, seq: u64) -> Result<bool, StoreError> {
        self.write(|txn, _| {
            let known = txn.open_table(NOTICES)?.get(seq)?.is_some();
            if known {
                remove_seq_row(txn, NOTICES, seq)?;
            }
            Ok(known)
        })
    }
}

//! Local storage errors.
//!
//! Remote failures live in [`crate::remote::RemoteError`]; they are never
//! converted into a `StoreError` because the engine handles them itself.

use crate::identity::{EntityId, EntityKind};
use crate::model::TabStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("tab {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: EntityId,
        status: TabStatus,
        action: &'static str,
    },

    #[error("line item {item} references unknown tab {tab}")]
    OrphanLineItem { item: EntityId, tab: EntityId },

    /// An engine invariant did not hold (e.g. rename of a record that is gone)
    #[error("invariant violated: {0}")]
    MissingRecord(String),

    #[error("queue entry {0} not found")]
    UnknownEntry(u64),

    #[error("amount out of range: {0}")]
    AmountOverflow(String),
}

impl StoreError {
    /// True for errors caused by the caller's request rather than the disk.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::InvalidTransition { .. }
                | StoreError::OrphanLineItem { .. }
                | StoreError::AmountOverflow(_)
        )
    }
}

/// Failure of a staff action submitted through the service facade.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

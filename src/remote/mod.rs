//! Interface to the remote authority: the system of record for tabs.
//!
//! The engine only needs "send mutation, get success or a classified failure"
//! and "receive change events"; transport lives behind [`RemoteAuthority`].

pub mod http;

use crate::identity::{EntityKind, LocalId};
use crate::model::{ItemDraft, PaymentInfo, TabStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use http::HttpAuthority;

/// Failure reported by (or while talking to) the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network error, timeout, or server hiccup: retry later
    #[error("transient: {0}")]
    Transient(String),
    /// Server state diverged (e.g. tab already closed elsewhere)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Validation failure; resending cannot succeed
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteError::Transient(_))
    }
}

/// Payload of a tab creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTab {
    pub number: u64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTab {
    pub canonical_id: String,
    /// Tenant sequence number assigned by the authority, if it differs
    #[serde(default)]
    pub number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedLineItem {
    pub canonical_id: String,
}

/// Authoritative state of a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTab {
    pub tenant_id: String,
    pub number: u64,
    pub status: TabStatus,
    pub total_cents: i64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Authoritative state of a line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLineItem {
    /// Canonical id of the owning tab
    pub tab_id: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of the reconciliation read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedTab {
    pub canonical_id: String,
    #[serde(flatten)]
    pub tab: RemoteTab,
    pub server_sequence: u64,
}

/// New state carried by a change event, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_kind", content = "new_state", rename_all = "snake_case")]
pub enum RemoteState {
    Tab(RemoteTab),
    LineItem(RemoteLineItem),
}

/// One event from the tenant change feed.
///
/// Delivered at least once, ordered per entity by `server_sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub canonical_id: String,
    /// Local identity the record was created under, when the authority knows it
    #[serde(default)]
    pub local_id: Option<LocalId>,
    #[serde(flatten)]
    pub state: RemoteState,
    pub server_sequence: u64,
}

impl ChangeEvent {
    pub fn entity_kind(&self) -> EntityKind {
        match self.state {
            RemoteState::Tab(_) => EntityKind::Tab,
            RemoteState::LineItem(_) => EntityKind::LineItem,
        }
    }

    /// Canonical id of the tab whose dependency chain this event belongs to.
    pub fn chain_id(&self) -> &str {
        match &self.state {
            RemoteState::Tab(_) => &self.canonical_id,
            RemoteState::LineItem(item) => &item.tab_id,
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RemoteError>>;

/// Outbound and inbound operations of the remote authority.
///
/// Creates carry the local identity so the authority can deduplicate a
/// request that is resent after a lost acknowledgement.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn create_tab(
        &self,
        local_id: &LocalId,
        tenant_id: &str,
        payload: &NewTab,
    ) -> Result<CreatedTab, RemoteError>;

    async fn add_line_item(
        &self,
        local_id: &LocalId,
        tab_ref: &str,
        payload: &ItemDraft,
    ) -> Result<CreatedLineItem, RemoteError>;

    async fn close_tab(&self, tab_ref: &str, payment: &PaymentInfo) -> Result<(), RemoteError>;

    async fn cancel_tab(&self, tab_ref: &str, reason: Option<&str>) -> Result<(), RemoteError>;

    /// Read path used for reconciliation after a terminal failure.
    async fn fetch_tab(&self, tab_ref: &str) -> Result<FetchedTab, RemoteError>;

    /// Subscribe to the tenant-scoped change feed.
    async fn subscribe(&self, tenant_id: &str) -> Result<ChangeStream, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_wire_shape() {
        let json = r#"{
            "entity_kind": "line_item",
            "canonical_id": "item-9",
            "new_state": {
                "tab_id": "tab-1",
                "description": "Caipirinha",
                "quantity": 2,
                "unit_price_cents": 2200,
                "created_at": "2026-03-01T21:00:00Z"
            },
            "server_sequence": 14
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.entity_kind(), EntityKind::LineItem);
        assert_eq!(event.chain_id(), "tab-1");
        assert_eq!(event.server_sequence, 14);
        assert!(event.local_id.is_none());
    }

    #[test]
    fn test_error_classification() {
        assert!(!RemoteError::Transient("timeout".into()).is_terminal());
        assert!(RemoteError::Conflict("closed".into()).is_terminal());
        assert!(RemoteError::Rejected("bad quantity".into()).is_terminal());
    }
}

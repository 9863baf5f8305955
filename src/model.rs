//! Tabs (comandas) and their line items as held in the Local Store.

use crate::identity::{EntityId, LocalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a tab. Only ever moves `Open -> Closed | Cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    Open,
    Closed,
    Cancelled,
}

impl TabStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TabStatus::Open)
    }
}

impl fmt::Display for TabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabStatus::Open => f.write_str("open"),
            TabStatus::Closed => f.write_str("closed"),
            TabStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Where the current state of a record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Written optimistically on this device, not yet acknowledged
    Local,
    /// Acknowledged by, or received from, the remote authority
    Confirmed,
    /// The authority refused the creating mutation
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub id: EntityId,
    /// Local identity this record was created under, kept after rename
    #[serde(default)]
    pub origin: Option<LocalId>,
    pub tenant_id: String,
    /// Per-tenant sequence number (provisional until acknowledged)
    pub number: u64,
    pub status: TabStatus,
    pub total_cents: i64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub provenance: Provenance,
    /// Last authority feed sequence applied to this record
    #[serde(default)]
    pub server_sequence: Option<u64>,
}

impl Tab {
    pub fn is_open(&self) -> bool {
        self.status == TabStatus::Open
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: EntityId,
    #[serde(default)]
    pub origin: Option<LocalId>,
    /// Owning tab; always resolves to a tab in the Local Store
    pub tab_id: EntityId,
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    #[serde(default)]
    pub server_sequence: Option<u64>,
}

/// What staff enter when adding an item to a tab.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub note: Option<String>,
}

impl ItemDraft {
    /// `None` when the total does not fit in cents.
    pub fn line_total_cents(&self) -> Option<i64> {
        self.unit_price_cents.checked_mul(i64::from(self.quantity))
    }
}

/// Payment details handed to the authority when a tab is closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub method: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub tip_cents: i64,
}

//! Dual identity for syncable records.
//!
//! A record is born with a [`LocalId`] minted on this device and is later
//! renamed to the identifier issued by the remote authority. The two forms are
//! kept apart by [`EntityId`]; only the textual encoding used for storage keys
//! and URLs relies on the reserved `local:` prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved prefix of the textual form of a local identity.
pub const LOCAL_PREFIX: &str = "local:";

/// Identity minted on-device before the authority has acknowledged a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Mint a fresh local identity.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", LOCAL_PREFIX, self.0)
    }
}

impl FromStr for LocalId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(LOCAL_PREFIX).unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| IdentityParseError(s.to_string()))
    }
}

/// Identity of a tab or line item: either still local, or canonical.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    Local(LocalId),
    Canonical(String),
}

impl EntityId {
    pub fn is_local(&self) -> bool {
        matches!(self, EntityId::Local(_))
    }

    pub fn as_local(&self) -> Option<&LocalId> {
        match self {
            EntityId::Local(id) => Some(id),
            EntityId::Canonical(_) => None,
        }
    }

    pub fn as_canonical(&self) -> Option<&str> {
        match self {
            EntityId::Local(_) => None,
            EntityId::Canonical(id) => Some(id),
        }
    }

    /// Key under which the record is stored.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl From<LocalId> for EntityId {
    fn from(id: LocalId) -> Self {
        EntityId::Local(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Local(id) => id.fmt(f),
            EntityId::Canonical(id) => f.write_str(id),
        }
    }
}

impl FromStr for EntityId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityParseError(s.to_string()));
        }
        if s.starts_with(LOCAL_PREFIX) {
            s.parse().map(EntityId::Local)
        } else {
            Ok(EntityId::Canonical(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid entity id: {0:?}")]
pub struct IdentityParseError(pub String);

/// Kind of syncable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tab,
    LineItem,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Tab => f.write_str("tab"),
            EntityKind::LineItem => f.write_str("line_item"),
        }
    }
}

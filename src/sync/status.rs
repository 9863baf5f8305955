//! Aggregate sync state shown to staff: how much is still owed to the
//! authority, and whether it is getting through.

use crate::connectivity::ConnectivityMonitor;
use crate::error::StoreError;
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the engine last did. Published by the engine after each drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProgress {
    /// When the engine last tried to send anything
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When a drain last finished with every ready entry acknowledged
    pub last_success_at: Option<DateTime<Utc>>,
    /// Retry delay in effect after a transient failure
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    /// Mutations not yet acknowledged
    pub pending: usize,
    /// Entries set aside after an invariant violation
    pub parked: usize,
    /// Feed events waiting behind pending work
    pub deferred: usize,
    /// Unacknowledged notices
    pub notices: usize,
    /// True once an entry has failed `stall_after_attempts` times
    pub stalled: bool,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub progress: EngineProgress,
}

impl SyncStatus {
    /// Gather the current status from the store and the monitor.
    pub fn collect(
        store: &LocalStore,
        connectivity: &ConnectivityMonitor,
        progress: EngineProgress,
        stall_after_attempts: u32,
    ) -> Result<Self, StoreError> {
        let (max_attempts, last_error) = store.max_attempts()?.unwrap_or((0, None));
        Ok(Self {
            online: connectivity.is_online(),
            pending: store.pending_sync_count()?,
            parked: store.parked_entries()?.len(),
            deferred: store.deferred_changes()?.len(),
            notices: store.notices()?.len(),
            stalled: max_attempts >= stall_after_attempts,
            max_attempts,
            last_error,
            progress,
        })
    }

    /// Nothing left to send and nothing stuck.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.parked == 0
    }
}

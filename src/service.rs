//! The device-facing facade the POS UI talks to.
//!
//! Every action returns as soon as the Local Store transaction commits; none
//! of them wait for the network.

use crate::connectivity::ConnectivityMonitor;
use crate::error::{ServiceError, StoreError};
use crate::identity::EntityId;
use crate::model::{ItemDraft, LineItem, PaymentInfo, Tab};
use crate::store::{LocalStore, Notice, StoreEvent};
use crate::sync::{EngineProgress, SyncStatus};
use futures::stream::Stream;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

#[derive(Clone)]
pub struct TabService {
    store: Arc<LocalStore>,
    connectivity: Arc<ConnectivityMonitor>,
    progress: watch::Receiver<EngineProgress>,
    tenant_id: String,
    stall_after_attempts: u32,
}

impl TabService {
    pub fn new(
        store: Arc<LocalStore>,
        connectivity: Arc<ConnectivityMonitor>,
        progress: watch::Receiver<EngineProgress>,
        tenant_id: impl Into<String>,
        stall_after_attempts: u32,
    ) -> Self {
        Self {
            store,
            connectivity,
            progress,
            tenant_id: tenant_id.into(),
            stall_after_attempts,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn open_tab(&self) -> Result<Tab, ServiceError> {
        let tab = self.store.record_open_tab(&self.tenant_id)?;
        tracing::info!("Opened tab #{} ({})", tab.number, tab.id);
        Ok(tab)
    }

    pub fn add_item(&self, tab_id: &EntityId, draft: ItemDraft) -> Result<LineItem, ServiceError> {
        if draft.description.trim().is_empty() {
            return Err(ServiceError::Invalid("description must not be empty".to_string()));
        }
        if draft.quantity == 0 {
            return Err(ServiceError::Invalid("quantity must be at least 1".to_string()));
        }
        if draft.unit_price_cents < 0 {
            return Err(ServiceError::Invalid("unit price must not be negative".to_string()));
        }
        if draft.line_total_cents().is_none() {
            return Err(ServiceError::Invalid("line total is out of range".to_string()));
        }
        match self.store.record_line_item(tab_id, draft) {
            Ok(item) => Ok(item),
            Err(StoreError::AmountOverflow(detail)) => {
                Err(ServiceError::Invalid(format!("amount out of range: {}", detail)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn close_tab(&self, tab_id: &EntityId, payment: PaymentInfo) -> Result<Tab, ServiceError> {
        if payment.amount_cents < 0 || payment.tip_cents < 0 {
            return Err(ServiceError::Invalid("payment amounts must not be negative".to_string()));
        }
        Ok(self.store.record_close(tab_id, payment)?)
    }

    pub fn cancel_tab(&self, tab_id: &EntityId, reason: Option<String>) -> Result<Tab, ServiceError> {
        Ok(self.store.record_cancel(tab_id, reason)?)
    }

    pub fn get_tab(&self, tab_id: &EntityId) -> Result<Option<Tab>, StoreError> {
        self.store.get_tab(tab_id)
    }

    pub fn open_tabs(&self) -> Result<Vec<Tab>, StoreError> {
        self.store.get_open_tabs(&self.tenant_id)
    }

    pub fn line_items(&self, tab_id: &EntityId) -> Result<Vec<LineItem>, StoreError> {
        self.store.line_items(tab_id)
    }

    pub fn pending_sync_count(&self) -> Result<usize, StoreError> {
        self.store.pending_sync_count()
    }

    pub fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        SyncStatus::collect(
            &self.store,
            &self.connectivity,
            self.progress.borrow().clone(),
            self.stall_after_attempts,
        )
    }

    pub fn notices(&self) -> Result<Vec<Notice>, StoreError> {
        self.store.notices()
    }

    pub fn dismiss_notice(&self, seq: u64) -> Result<bool, StoreError> {
        self.store.dismiss_notice(seq)
    }

    /// Stream of open-tab snapshots: the current one first, then one after
    /// every change to this tenant's tabs.
    pub fn subscribe_open_tabs(&self) -> impl Stream<Item = Vec<Tab>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let tenant_id = self.tenant_id.clone();
        let mut changes = store.subscribe();

        async_stream::stream! {
            match store.get_open_tabs(&tenant_id) {
                Ok(tabs) => yield tabs,
                Err(e) => tracing::error!("Failed to read open tabs: {}", e),
            }
            loop {
                match changes.recv().await {
                    Ok(StoreEvent::TabsChanged { tenant_id: changed }) if changed == tenant_id => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                match store.get_open_tabs(&tenant_id) {
                    Ok(tabs) => yield tabs,
                    Err(e) => tracing::error!("Failed to read open tabs: {}", e),
                }
            }
        }
    }
}

use crate::backend::HistoryBackend;
use crate::observer::{SubscriptionId, Subscribers};
use ocss_core::{CoreError, ErrorExt, HistoryError, SearchParams, SearchRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct HistoryState {
    records: Vec<SearchRecord>,
    /// Ticket of the change currently held.
    applied: u64,
}

/// One user's past searches, mirrored from the backend.
///
/// The backend is the source of truth: every mutation is followed by a full
/// re-fetch, and local edits only bridge the gap until it lands. Each change
/// takes a ticket when it starts; a listing that lands after a newer change
/// has been applied is dropped.
pub struct SearchHistoryStore {
    backend: Arc<dyn HistoryBackend>,
    owner: String,
    state: Mutex<HistoryState>,
    next_ticket: AtomicU64,
    /// Held from storing a list until every subscriber has seen it.
    delivery: Mutex<()>,
    subscribers: Subscribers<Vec<SearchRecord>>,
}

impl SearchHistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>, owner: impl Into<String>) -> Self {
        Self {
            backend,
            owner: owner.into(),
            state: Mutex::new(HistoryState {
                records: Vec::new(),
                applied: 0,
            }),
            next_ticket: AtomicU64::new(0),
            delivery: Mutex::new(()),
            subscribers: Subscribers::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn records(&self) -> Vec<SearchRecord> {
        self.state.lock().records.clone()
    }

    pub fn record(&self, search_id: i64) -> Option<SearchRecord> {
        self.state
            .lock()
            .records
            .iter()
            .find(|r| r.search_id == search_id)
            .cloned()
    }

    pub fn on_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Vec<SearchRecord>) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Replaces the local list with the backend's and returns the latter.
    pub async fn list(&self) -> Result<Vec<SearchRecord>, CoreError> {
        let ticket = self.ticket();
        let records = self
            .backend
            .list_searches(&self.owner)
            .await
            .map_err(|e| sync_failed("list", e))?;
        debug!("Search history for {} has {} entries", self.owner, records.len());
        let fresh = records.clone();
        if !self.apply(ticket, move |current| *current = fresh) {
            debug!("Dropping history listing {} superseded by a newer change", ticket);
        }
        Ok(records)
    }

    pub async fn add(&self, params: &SearchParams) -> Result<(), CoreError> {
        self.backend
            .add_search(&self.owner, params)
            .await
            .map_err(|e| sync_failed("add", e))?;
        info!("Recorded search for r/{}", params.subreddit);
        self.list().await?;
        Ok(())
    }

    /// Drops the entry locally right away, deletes it remotely, then
    /// reconciles with the backend whether or not the delete worked.
    pub async fn remove(&self, search_id: i64) -> Result<(), CoreError> {
        let ticket = self.ticket();
        self.apply(ticket, |records| records.retain(|r| r.search_id != search_id));

        let deleted = self
            .backend
            .remove_search(search_id)
            .await
            .map_err(|e| sync_failed("remove", e));
        if let Err(e) = &deleted {
            warn!("Failed to remove search {}: {}", search_id, e);
        }

        let reconciled = self.list().await;
        deleted?;
        reconciled.map(|_| ())
    }

    pub async fn clear_all(&self) -> Result<(), CoreError> {
        self.backend
            .clear_searches(&self.owner)
            .await
            .map_err(|e| sync_failed("clear", e))?;
        info!("Cleared search history for {}", self.owner);
        self.list().await?;
        Ok(())
    }

    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies `change` unless a newer ticket already has been, then
    /// notifies. Deliveries never interleave.
    fn apply(&self, ticket: u64, change: impl FnOnce(&mut Vec<SearchRecord>)) -> bool {
        let _delivery = self.delivery.lock();
        let records = {
            let mut state = self.state.lock();
            if ticket < state.applied {
                return false;
            }
            state.applied = ticket;
            change(&mut state.records);
            state.records.clone()
        };
        self.subscribers.notify(&records);
        true
    }
}

fn sync_failed(operation: &str, error: CoreError) -> CoreError {
    if let CoreError::History(_) = error {
        return error;
    }
    HistoryError::SyncFailed {
        operation: operation.to_string(),
        message: error.user_friendly_message(),
    }
    .into()
}

use crate::backend::DatasetBackend;
use crate::debounce::Debouncer;
use crate::observer::{SubscriptionId, Subscribers};
use ocss_core::{
    is_possibly_insufficient, ApiError, CoreError, DatasetError, DatasetPage, DatasetRow,
    ErrorExt, PagedQuery, SearchParams,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the dataset view currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSnapshot {
    pub draw: u64,
    pub offset: u64,
    pub rows: Vec<DatasetRow>,
    pub total_rows: u64,
    pub filtered_rows: u64,
    pub possibly_insufficient: bool,
    /// Set when the latest query failed; rows from the last good page stay.
    pub error: Option<String>,
}

/// View model the paged source pushes into.
///
/// Responses are applied in draw order: anything tagged with a draw at or
/// below the last applied one is dropped.
#[derive(Debug, Default)]
pub struct DatasetView {
    snapshot: Mutex<DatasetSnapshot>,
    subscribers: Subscribers<DatasetSnapshot>,
}

impl DatasetView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DatasetSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn on_data_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DatasetSnapshot) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn apply_page(&self, offset: u64, page: DatasetPage) -> bool {
        let updated = {
            let mut snapshot = self.snapshot.lock();
            if page.draw <= snapshot.draw {
                debug!("Dropping stale page draw={} (showing {})", page.draw, snapshot.draw);
                return false;
            }
            *snapshot = DatasetSnapshot {
                draw: page.draw,
                offset,
                possibly_insufficient: page.possibly_insufficient(),
                total_rows: page.total_rows,
                filtered_rows: page.filtered_rows,
                rows: page.rows,
                error: None,
            };
            snapshot.clone()
        };
        self.subscribers.notify(&updated);
        true
    }

    pub fn apply_error(&self, draw: u64, message: String) -> bool {
        let updated = {
            let mut snapshot = self.snapshot.lock();
            if draw <= snapshot.draw {
                debug!("Dropping stale failure draw={} (showing {})", draw, snapshot.draw);
                return false;
            }
            snapshot.draw = draw;
            snapshot.error = Some(message);
            snapshot.clone()
        };
        self.subscribers.notify(&updated);
        true
    }
}

/// Server-side paged access to one collection of posts.
///
/// The selector picks the collection (subreddit, sources, date range); the
/// filter text narrows it. Every query gets a fresh, increasing draw token.
pub struct PagedDatasetSource {
    backend: Arc<dyn DatasetBackend>,
    view: Arc<DatasetView>,
    page_size: u64,
    next_draw: AtomicU64,
    reload: Debouncer,
}

impl PagedDatasetSource {
    pub fn new(backend: Arc<dyn DatasetBackend>, page_size: u64, reload_delay: Duration) -> Self {
        Self {
            backend,
            view: Arc::new(DatasetView::new()),
            page_size: page_size.max(1),
            next_draw: AtomicU64::new(1),
            reload: Debouncer::new(reload_delay),
        }
    }

    pub fn view(&self) -> Arc<DatasetView> {
        Arc::clone(&self.view)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn next_query(&self, selector: &SearchParams, filter_text: &str, offset: u64) -> PagedQuery {
        PagedQuery {
            offset,
            limit: self.page_size,
            draw: self.next_draw.fetch_add(1, Ordering::SeqCst),
            filter_text: filter_text.to_string(),
            selector: selector.clone(),
        }
    }

    /// Fetches one page without touching the view.
    ///
    /// Failures are always `DatasetError`, never an empty page.
    pub async fn query(&self, query: &PagedQuery) -> Result<DatasetPage, CoreError> {
        self.backend.fetch_page(query).await.map_err(into_dataset_error)
    }

    /// Fetches a page and pushes it (or the failure) into the view.
    pub async fn load(
        &self,
        selector: &SearchParams,
        filter_text: &str,
        offset: u64,
    ) -> Result<DatasetPage, CoreError> {
        let query = self.next_query(selector, filter_text, offset);
        match self.query(&query).await {
            Ok(page) => {
                if is_possibly_insufficient(page.filtered_rows) {
                    info!(
                        "Only {} matching rows for r/{}; clustering may be unreliable",
                        page.filtered_rows, selector.subreddit
                    );
                }
                self.view.apply_page(offset, page.clone());
                Ok(page)
            }
            Err(e) => {
                warn!("Dataset query draw={} failed: {}", query.draw, e);
                self.view.apply_error(query.draw, e.user_friendly_message());
                Err(e)
            }
        }
    }

    /// Reloads the first page once the selector has been stable for the
    /// reload delay. Returns `None` if a later call superseded this one.
    pub async fn schedule_reload(
        &self,
        selector: SearchParams,
        filter_text: String,
    ) -> Option<Result<DatasetPage, CoreError>> {
        self.reload
            .run(|| async move { self.load(&selector, &filter_text, 0).await })
            .await
    }

    /// Every matching row, one page at a time.
    pub async fn fetch_all(
        &self,
        selector: &SearchParams,
        filter_text: &str,
    ) -> Result<Vec<DatasetRow>, CoreError> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let query = self.next_query(selector, filter_text, offset);
            let page = self.query(&query).await?;
            if page.rows.is_empty() {
                break;
            }
            offset += page.rows.len() as u64;
            rows.extend(page.rows);
            if offset >= page.filtered_rows {
                break;
            }
        }
        debug!("Fetched {} rows for r/{}", rows.len(), selector.subreddit);
        Ok(rows)
    }
}

pub(crate) fn into_dataset_error(error: CoreError) -> CoreError {
    match error {
        CoreError::Api(ApiError::Status {
            status_code,
            message,
        }) => DatasetError::QueryFailed {
            message,
            status_code: Some(status_code),
        }
        .into(),
        CoreError::Api(e) => DatasetError::QueryFailed {
            message: e.to_string(),
            status_code: None,
        }
        .into(),
        CoreError::Network(e) => DatasetError::QueryFailed {
            message: e.to_string(),
            status_code: None,
        }
        .into(),
        other => other,
    }
}

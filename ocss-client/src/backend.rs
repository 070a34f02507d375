//! Seams between the client-side state machines and the HTTP backend.
//!
//! [`crate::api::OcssApiClient`] implements all of them; tests substitute
//! scripted implementations.

use async_trait::async_trait;
use ocss_core::{
    CoreError, DatasetPage, JobRequest, PagedQuery, ProgressResponse, SearchParams, SearchRecord,
};

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Starts a job and returns the backend's job id.
    async fn submit_job(&self, request: &JobRequest) -> Result<String, CoreError>;

    async fn job_progress(&self, job_id: &str) -> Result<ProgressResponse, CoreError>;

    /// The raw `result` payload of a finished job.
    async fn job_result(&self, job_id: &str) -> Result<serde_json::Value, CoreError>;
}

#[async_trait]
pub trait DatasetBackend: Send + Sync {
    async fn fetch_page(&self, query: &PagedQuery) -> Result<DatasetPage, CoreError>;
}

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn add_search(&self, owner: &str, params: &SearchParams) -> Result<(), CoreError>;

    /// An owner without any searches yields an empty list.
    async fn list_searches(&self, owner: &str) -> Result<Vec<SearchRecord>, CoreError>;

    async fn remove_search(&self, search_id: i64) -> Result<(), CoreError>;

    async fn clear_searches(&self, owner: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait SuggestionBackend: Send + Sync {
    async fn subreddit_suggestions(&self, prefix: &str) -> Result<Vec<String>, CoreError>;
}

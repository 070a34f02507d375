use crate::arrow_codec;
use crate::backend::{AnalysisBackend, DatasetBackend, HistoryBackend, SuggestionBackend};
use crate::dataset::into_dataset_error;
use crate::metrics::{ApiMetrics, MetricsCollector, RequestMetrics};
use async_trait::async_trait;
use ocss_core::{
    filter_query_pairs, ApiError, BackendConfig, CoreError, DatasetPage,
    ExportFormat, JobRequest, NewSearchRecord, PagedQuery, ProgressResponse, PublishRequest,
    PublishedResult, SearchParams, SearchRecord, TopicGroup,
};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct JobSubmitted {
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublishedResults {
    #[serde(default)]
    results: Vec<PublishedResult>,
}

#[derive(Debug, Deserialize)]
struct SearchHistoryListing {
    #[serde(default)]
    search_history: Vec<SearchRecord>,
}

/// HTTP client for the OCSS analysis backend.
#[derive(Debug, Clone)]
pub struct OcssApiClient {
    http_client: Client,
    base_url: Url,
    metrics: Arc<MetricsCollector>,
}

impl OcssApiClient {
    pub fn new(config: &BackendConfig) -> Result<Self, CoreError> {
        let base_url = Url::parse(&config.base_url).map_err(|_| ApiError::InvalidUrl {
            url: config.base_url.clone(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl {
                url: config.base_url.clone(),
            }
            .into());
        }

        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins path segments onto the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, CoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl {
                url: self.base_url.to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends a request and maps non-2xx responses to [`ApiError::Status`].
    ///
    /// `route` is the metrics key and log label; it never carries ids.
    async fn execute(
        &self,
        method: Method,
        route: &str,
        url: Url,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<Response, CoreError> {
        let start_time = Instant::now();

        let mut request_builder = self.http_client.request(method.clone(), url);
        if !query.is_empty() {
            request_builder = request_builder.query(query);
        }
        if let Some(body) = body {
            request_builder = request_builder.json(body);
        }

        debug!("Backend request: {} {}", method, route);
        let outcome = request_builder.send().await;

        let (status_code, success) = match &outcome {
            Ok(response) => (
                Some(response.status().as_u16()),
                response.status().is_success(),
            ),
            Err(_) => (None, false),
        };
        self.metrics
            .record_request(RequestMetrics {
                endpoint: route.to_string(),
                method: method.to_string(),
                status_code,
                response_time: start_time.elapsed(),
                success,
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                error!("Network error for {} {}: {}", method, route, e);
                if e.is_timeout() {
                    return Err(ApiError::RequestTimeout {
                        endpoint: route.to_string(),
                    }
                    .into());
                }
                return Err(CoreError::Network(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Failed to read error body from {}: {}", route, e);
                Default::default()
            }
        };
        let message = decode_error_body(status, &bytes);
        warn!("{} {} failed with {}: {}", method, route, status, message);
        Err(ApiError::Status {
            status_code: status.as_u16(),
            message,
        }
        .into())
    }

    async fn read_json<T: DeserializeOwned>(route: &str, response: Response) -> Result<T, CoreError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            error!("Failed to parse response from {}: {}", route, e);
            ApiError::InvalidResponse {
                endpoint: route.to_string(),
                details: e.to_string(),
            }
            .into()
        })
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn reset_metrics(&self) {
        self.metrics.reset_metrics().await
    }

    /// `GET /api/export_data`; the body is the file as served.
    pub async fn export_data(
        &self,
        format: ExportFormat,
        selector: &SearchParams,
        filter_text: &str,
    ) -> Result<Vec<u8>, CoreError> {
        let route = "/api/export_data";
        let url = self.endpoint(&["api", "export_data"])?;
        let mut query = vec![("format", format.as_str().to_string())];
        query.extend(filter_query_pairs(selector, filter_text));

        let response = self.execute(Method::GET, route, url, &query, None).await?;
        let bytes = response.bytes().await?;
        info!(
            "Exported {} bytes of {} for r/{}",
            bytes.len(),
            format.as_str(),
            selector.subreddit
        );
        Ok(bytes.to_vec())
    }

    pub async fn save_result(&self, request: &PublishRequest<'_>) -> Result<(), CoreError> {
        let route = "/api/save_result";
        let url = self.endpoint(&["api", "save_result"])?;
        let body = serde_json::to_value(request)?;
        self.execute(Method::POST, route, url, &[], Some(&body)).await?;
        info!("Published result for r/{}", request.params.subreddit);
        Ok(())
    }

    pub async fn list_results(&self) -> Result<Vec<PublishedResult>, CoreError> {
        let route = "/api/get_result";
        let url = self.endpoint(&["api", "get_result"])?;
        let response = self.execute(Method::GET, route, url, &[], None).await?;
        let listing: PublishedResults = Self::read_json(route, response).await?;
        Ok(listing.results)
    }

    pub async fn result_topics(&self, result_id: i64) -> Result<Vec<TopicGroup>, CoreError> {
        let route = "/api/get_topics";
        let id = result_id.to_string();
        let url = self.endpoint(&["api", "get_topics", id.as_str()])?;
        let response = self.execute(Method::GET, route, url, &[], None).await?;
        let payload: serde_json::Value = Self::read_json(route, response).await?;
        decode_topic_groups(payload).map_err(|e| {
            ApiError::InvalidResponse {
                endpoint: route.to_string(),
                details: e.to_string(),
            }
            .into()
        })
    }

    pub async fn remove_result(&self, result_id: i64) -> Result<(), CoreError> {
        let route = "/api/remove_result";
        let id = result_id.to_string();
        let url = self.endpoint(&["api", "remove_result", id.as_str()])?;
        self.execute(Method::DELETE, route, url, &[], None).await?;
        info!("Removed published result {}", result_id);
        Ok(())
    }
}

#[async_trait]
impl AnalysisBackend for OcssApiClient {
    async fn submit_job(&self, request: &JobRequest) -> Result<String, CoreError> {
        let (route, segment) = match request {
            JobRequest::TopicClustering(_) => ("/api/run_topic", "run_topic"),
            JobRequest::SentimentAnalysis(_) => ("/api/run_sentiment", "run_sentiment"),
        };
        let url = self.endpoint(&["api", segment])?;
        let body = request.body()?;

        let response = self.execute(Method::POST, route, url, &[], Some(&body)).await?;
        let submitted: JobSubmitted = Self::read_json(route, response).await?;
        submitted
            .job_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ApiError::InvalidResponse {
                    endpoint: route.to_string(),
                    details: "response did not include a job_id".to_string(),
                }
                .into()
            })
    }

    async fn job_progress(&self, job_id: &str) -> Result<ProgressResponse, CoreError> {
        let route = "/api/progress";
        let url = self.endpoint(&["api", "progress", job_id])?;
        let response = self.execute(Method::GET, route, url, &[], None).await?;
        Self::read_json(route, response).await
    }

    async fn job_result(&self, job_id: &str) -> Result<serde_json::Value, CoreError> {
        let route = "/api/get_result";
        let url = self.endpoint(&["api", "get_result", job_id])?;
        let response = self.execute(Method::GET, route, url, &[], None).await?;
        let mut payload: serde_json::Value = Self::read_json(route, response).await?;

        match payload.get_mut("result").map(serde_json::Value::take) {
            Some(serde_json::Value::Null) | None => Err(ApiError::InvalidResponse {
                endpoint: route.to_string(),
                details: format!("no result for job {}", job_id),
            }
            .into()),
            Some(result) => Ok(result),
        }
    }
}

#[async_trait]
impl DatasetBackend for OcssApiClient {
    async fn fetch_page(&self, query: &PagedQuery) -> Result<DatasetPage, CoreError> {
        let route = "/api/get_arrow";
        let url = self.endpoint(&["api", "get_arrow"])?;

        let response = self
            .execute(Method::GET, route, url, &query.to_query_pairs(), None)
            .await
            .map_err(into_dataset_error)?;

        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| into_dataset_error(e.into()))?;
        let rows = arrow_codec::decode_rows(&bytes)?;

        let filtered_rows = header_u64(&headers, "X-Records-Filtered").unwrap_or(rows.len() as u64);
        let page = DatasetPage {
            draw: header_u64(&headers, "X-Draw").unwrap_or(query.draw),
            total_rows: header_u64(&headers, "X-Records-Total").unwrap_or(filtered_rows),
            filtered_rows,
            rows,
        };
        debug!(
            "Fetched page draw={} offset={} rows={} filtered={}",
            page.draw,
            query.offset,
            page.rows.len(),
            page.filtered_rows
        );
        Ok(page)
    }
}

#[async_trait]
impl HistoryBackend for OcssApiClient {
    async fn add_search(&self, owner: &str, params: &SearchParams) -> Result<(), CoreError> {
        let route = "/api/add_search";
        let url = self.endpoint(&["api", "add_search"])?;
        let body = serde_json::to_value(NewSearchRecord {
            email: owner,
            params,
        })?;
        self.execute(Method::POST, route, url, &[], Some(&body)).await?;
        Ok(())
    }

    async fn list_searches(&self, owner: &str) -> Result<Vec<SearchRecord>, CoreError> {
        let route = "/api/get_search";
        let url = self.endpoint(&["api", "get_search", owner])?;
        match self.execute(Method::GET, route, url, &[], None).await {
            Ok(response) => {
                let listing: SearchHistoryListing = Self::read_json(route, response).await?;
                Ok(listing.search_history)
            }
            // "Search history empty."
            Err(CoreError::Api(ApiError::Status {
                status_code: 404, ..
            })) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn remove_search(&self, search_id: i64) -> Result<(), CoreError> {
        let route = "/api/remove_search";
        let id = search_id.to_string();
        let url = self.endpoint(&["api", "remove_search", id.as_str()])?;
        self.execute(Method::DELETE, route, url, &[], None).await?;
        Ok(())
    }

    async fn clear_searches(&self, owner: &str) -> Result<(), CoreError> {
        let route = "/api/clear_all";
        let url = self.endpoint(&["api", "clear_all", owner])?;
        self.execute(Method::DELETE, route, url, &[], None).await?;
        Ok(())
    }
}

#[async_trait]
impl SuggestionBackend for OcssApiClient {
    async fn subreddit_suggestions(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let route = "/api/search_list";
        let url = self.endpoint(&["api", "search_list"])?;
        let query = [("subreddit", prefix.to_string())];
        let response = self.execute(Method::GET, route, url, &query, None).await?;
        let names: Option<Vec<String>> = Self::read_json(route, response).await?;
        Ok(names.unwrap_or_default())
    }
}

/// Human-readable message for a failed response.
///
/// JSON bodies with an `error`, `message` or `detail` string win; anything
/// else falls back to the bare status.
pub fn decode_error_body(status: StatusCode, body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message", "detail"]
                .iter()
                .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_string))
        })
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn decode_topic_groups(payload: serde_json::Value) -> Result<Vec<TopicGroup>, serde_json::Error> {
    match payload {
        serde_json::Value::Object(mut map) if map.contains_key("groups") => {
            serde_json::from_value(map.remove("groups").unwrap_or_default())
        }
        other => serde_json::from_value(other),
    }
}

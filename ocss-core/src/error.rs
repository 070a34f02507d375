use crate::types::JobKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Backend API error: {0}")]
    Api(#[from] ApiError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Search history error: {0}")]
    History(#[from] HistoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Transport-level failures talking to the backend.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("{message}")]
    Status { status_code: u16, message: String },

    #[error("Invalid API response from {endpoint}: {details}")]
    InvalidResponse { endpoint: String, details: String },

    #[error("Request timeout for {endpoint}")]
    RequestTimeout { endpoint: String },

    #[error("Invalid backend URL: {url}")]
    InvalidUrl { url: String },
}

#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("Failed to start {kind} job: {reason}")]
    SubmissionFailed { kind: JobKind, reason: String },

    #[error("Progress polling failed for job {job_id}: {reason}")]
    PollFailed { job_id: String, reason: String },

    #[error("Result unavailable for job {job_id}: {reason}")]
    ResultUnavailable { job_id: String, reason: String },

    #[error("Precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Job {job_id} did not finish within {waited_secs} seconds")]
    PollTimeout { job_id: String, waited_secs: u64 },

    #[error("An analysis job is already running ({state})")]
    PipelineBusy { state: String },

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: String },
}

#[derive(Error, Debug, Clone)]
pub enum DatasetError {
    #[error("Dataset query failed: {message}")]
    QueryFailed {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Dataset payload could not be decoded: {details}")]
    InvalidPayload { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum HistoryError {
    #[error("Search history {operation} failed: {message}")]
    SyncFailed { operation: String, message: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration parsing error: {0}")]
    Parse(#[from] toml::de::Error),
}

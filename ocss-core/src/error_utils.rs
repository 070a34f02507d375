use crate::error::*;
use tracing::{error, info, warn};

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    /// Transient failures. Only used to decide whether a failed poll counts
    /// toward the consecutive-failure bound; nothing is retried automatically.
    fn is_retryable(&self) -> bool;
    fn user_friendly_message(&self) -> String;
    fn error_code(&self) -> String;
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!("CoreError: {}", self);
        match self {
            CoreError::Api(e) => {
                error!("Backend API error details: {:?}", e);
            }
            CoreError::Job(e) => {
                error!("Job error details: {:?}", e);
            }
            CoreError::Dataset(e) => {
                error!("Dataset error details: {:?}", e);
            }
            CoreError::History(e) => {
                error!("Search history error details: {:?}", e);
            }
            CoreError::Config(e) => {
                error!("Configuration error details: {:?}", e);
            }
            _ => {}
        }
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("CoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::Api(e) => e.is_retryable(),
            CoreError::Job(e) => e.is_retryable(),
            CoreError::Dataset(e) => e.is_retryable(),
            CoreError::History(e) => e.is_retryable(),
            CoreError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CoreError::Io(_) => true,
            _ => false,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::Api(e) => e.user_friendly_message(),
            CoreError::Job(e) => e.user_friendly_message(),
            CoreError::Dataset(e) => e.user_friendly_message(),
            CoreError::History(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => {
                "Could not reach the analysis server. Please check your connection.".to_string()
            }
            CoreError::Serialization(_) => {
                "The server sent a response that could not be read.".to_string()
            }
            CoreError::InvalidInput { message } => format!("Invalid input: {}", message),
            _ => "An unexpected error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            CoreError::Api(_) => "API".to_string(),
            CoreError::Job(_) => "JOB".to_string(),
            CoreError::Dataset(_) => "DATASET".to_string(),
            CoreError::History(_) => "HISTORY".to_string(),
            CoreError::Config(_) => "CONFIG".to_string(),
            CoreError::Io(_) => "IO".to_string(),
            CoreError::Serialization(_) => "SERIALIZATION".to_string(),
            CoreError::Network(_) => "NETWORK".to_string(),
            CoreError::InvalidInput { .. } => "INVALID_INPUT".to_string(),
            CoreError::Internal { .. } => "INTERNAL".to_string(),
        }
    }
}

impl ErrorExt for ApiError {
    fn log_error(&self) -> &Self {
        error!("ApiError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ApiError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status_code, .. } => *status_code >= 500 || *status_code == 429,
            ApiError::RequestTimeout { .. } => true,
            _ => false,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            // Already the backend's own message, or the raw status line
            ApiError::Status { message, .. } => message.clone(),
            ApiError::InvalidResponse { .. } => {
                "The server sent a response that could not be read.".to_string()
            }
            ApiError::RequestTimeout { .. } => {
                "The server took too long to respond. Please try again.".to_string()
            }
            ApiError::InvalidUrl { url } => format!("Invalid server address: {}", url),
        }
    }

    fn error_code(&self) -> String {
        match self {
            ApiError::Status { .. } => "API_STATUS".to_string(),
            ApiError::InvalidResponse { .. } => "API_INVALID_RESPONSE".to_string(),
            ApiError::RequestTimeout { .. } => "API_TIMEOUT".to_string(),
            ApiError::InvalidUrl { .. } => "API_INVALID_URL".to_string(),
        }
    }
}

impl ErrorExt for JobError {
    fn log_error(&self) -> &Self {
        error!("JobError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("JobError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn user_friendly_message(&self) -> String {
        match self {
            JobError::SubmissionFailed { kind, reason } => {
                format!("Could not start {}: {}", kind.display_name(), reason)
            }
            JobError::PollFailed { reason, .. } => {
                format!("Lost track of the running job: {}", reason)
            }
            JobError::ResultUnavailable { reason, .. } => {
                format!("The job finished but its result is unavailable: {}", reason)
            }
            JobError::PreconditionFailed { reason } => reason.clone(),
            JobError::JobFailed { message, .. } => message.clone(),
            JobError::PollTimeout { waited_secs, .. } => format!(
                "The job did not finish within {} seconds.",
                waited_secs
            ),
            JobError::PipelineBusy { .. } => {
                "An analysis is already running. Wait for it to finish or reset.".to_string()
            }
            JobError::Cancelled { .. } => "The analysis was cancelled.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            JobError::SubmissionFailed { .. } => "JOB_SUBMISSION_FAILED".to_string(),
            JobError::PollFailed { .. } => "JOB_POLL_FAILED".to_string(),
            JobError::ResultUnavailable { .. } => "JOB_RESULT_UNAVAILABLE".to_string(),
            JobError::PreconditionFailed { .. } => "JOB_PRECONDITION_FAILED".to_string(),
            JobError::JobFailed { .. } => "JOB_FAILED".to_string(),
            JobError::PollTimeout { .. } => "JOB_POLL_TIMEOUT".to_string(),
            JobError::PipelineBusy { .. } => "JOB_PIPELINE_BUSY".to_string(),
            JobError::Cancelled { .. } => "JOB_CANCELLED".to_string(),
        }
    }
}

impl ErrorExt for DatasetError {
    fn log_error(&self) -> &Self {
        error!("DatasetError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("DatasetError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatasetError::QueryFailed {
                status_code: None,
                ..
            }
        )
    }

    fn user_friendly_message(&self) -> String {
        match self {
            DatasetError::QueryFailed { message, .. } => message.clone(),
            DatasetError::InvalidPayload { .. } => {
                "The dataset could not be read. Please try again.".to_string()
            }
        }
    }

    fn error_code(&self) -> String {
        match self {
            DatasetError::QueryFailed { .. } => "DATASET_QUERY_FAILED".to_string(),
            DatasetError::InvalidPayload { .. } => "DATASET_INVALID_PAYLOAD".to_string(),
        }
    }
}

impl ErrorExt for HistoryError {
    fn log_error(&self) -> &Self {
        error!("HistoryError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("HistoryError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn user_friendly_message(&self) -> String {
        match self {
            HistoryError::SyncFailed { message, .. } => message.clone(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            HistoryError::SyncFailed { .. } => "HISTORY_SYNC_FAILED".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn log_error(&self) -> &Self {
        error!("ConfigError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ConfigError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false // Config errors need user intervention
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => {
                format!("Configuration file '{}' not found.", path)
            }
            ConfigError::MissingField { field } => {
                format!("Required configuration field '{}' is missing.", field)
            }
            ConfigError::InvalidValue { field, .. } => {
                format!("Invalid value for configuration field '{}'.", field)
            }
            _ => "Configuration error occurred. Please check your settings.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND".to_string(),
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD".to_string(),
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE".to_string(),
            ConfigError::ValidationFailed { .. } => "CONFIG_VALIDATION_FAILED".to_string(),
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR".to_string(),
        }
    }
}

pub struct ErrorReporter {
    report_errors: bool,
    report_warnings: bool,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self {
            report_errors: true,
            report_warnings: true,
        }
    }

    pub fn with_error_reporting(mut self, enabled: bool) -> Self {
        self.report_errors = enabled;
        self
    }

    pub fn with_warning_reporting(mut self, enabled: bool) -> Self {
        self.report_warnings = enabled;
        self
    }

    pub fn report_error(&self, error: &CoreError) {
        if self.report_errors {
            error.log_error();
            info!("Error code: {}", error.error_code());
            info!("User message: {}", error.user_friendly_message());
        }
    }

    pub fn report_warning(&self, error: &CoreError) {
        if self.report_warnings {
            error.log_warn();
        }
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

use crate::error::{ConfigError, CoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const BACKEND_URL_ENV: &str = "OCSS_BACKEND_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("ocss/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive transient poll failures tolerated before giving up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_max_wait_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_refetch_debounce_ms")]
    pub refetch_debounce_ms: u64,
    #[serde(default = "default_suggestion_debounce_ms")]
    pub suggestion_debounce_ms: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            refetch_debounce_ms: default_refetch_debounce_ms(),
            suggestion_debounce_ms: default_suggestion_debounce_ms(),
        }
    }
}

fn default_page_size() -> u64 {
    10
}
fn default_refetch_debounce_ms() -> u64 {
    1000
}
fn default_suggestion_debounce_ms() -> u64 {
    150
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl DatasetConfig {
    pub fn refetch_debounce(&self) -> Duration {
        Duration::from_millis(self.refetch_debounce_ms)
    }

    pub fn suggestion_debounce(&self) -> Duration {
        Duration::from_millis(self.suggestion_debounce_ms)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: AppConfig = toml::from_str(content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "backend.base_url".to_string(),
            });
        }

        let parsed = url::Url::parse(&self.backend.base_url).map_err(|_| ConfigError::InvalidValue {
            field: "backend.base_url".to_string(),
            value: self.backend.base_url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                field: "backend.base_url".to_string(),
                value: self.backend.base_url.clone(),
            });
        }

        if self.backend.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "backend.request_timeout_secs must be > 0".to_string(),
            });
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "polling.interval_ms must be > 0".to_string(),
            });
        }
        if self.polling.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "polling.max_consecutive_failures must be >= 1".to_string(),
            });
        }
        if self.dataset.page_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "dataset.page_size must be > 0".to_string(),
            });
        }

        Ok(())
    }

    /// `OCSS_BACKEND_URL` wins over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Overriding backend URL from {}", BACKEND_URL_ENV);
                self.backend.base_url = url.trim().to_string();
            }
        }
    }
}

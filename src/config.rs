use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RdaError;

pub const DEFAULT_CONFIG_FILE: &str = "rda-met.json";

pub const API_BASE_URL: &str = "https://rda.ucar.edu/json_apps";
pub const DOWNLOAD_LOGIN_URL: &str = "https://rda.ucar.edu/cgi-bin/login";
pub const COMPLETED_STATUS: &str = "Completed";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub login_url: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub completed_status: Option<String>,
    #[serde(default)]
    pub error_statuses: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_suffixes: Option<Vec<String>>,
    #[serde(default)]
    pub archive_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub path_identity: Option<PathIdentity>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_factor_ms: Option<u64>,
    #[serde(default)]
    pub status_forcelist: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathIdentity {
    #[default]
    TimeRange,
    Request,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: Duration,
    pub status_forcelist: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_millis(300),
            status_forcelist: vec![500, 502, 504],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusRules {
    pub completed: String,
    pub errors: Vec<String>,
}

impl Default for StatusRules {
    fn default() -> Self {
        Self {
            completed: COMPLETED_STATUS.to_string(),
            errors: vec!["Error".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub login_url: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub status: StatusRules,
    pub ignore_suffixes: Vec<String>,
    pub archive_extensions: Vec<String>,
    pub path_identity: PathIdentity,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: API_BASE_URL.to_string(),
            login_url: DOWNLOAD_LOGIN_URL.to_string(),
            poll_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            status: StatusRules::default(),
            ignore_suffixes: default_ignore_suffixes(),
            archive_extensions: default_archive_extensions(),
            path_identity: PathIdentity::TimeRange,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, RdaError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(PipelineConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RdaError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RdaError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<PipelineConfig, RdaError> {
        let defaults = PipelineConfig::default();

        let retry_entry = config.retry.unwrap_or_default();
        let retry = RetryPolicy {
            max_retries: retry_entry
                .max_retries
                .unwrap_or(defaults.retry.max_retries),
            backoff_factor: retry_entry
                .backoff_factor_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.backoff_factor),
            status_forcelist: retry_entry
                .status_forcelist
                .unwrap_or(defaults.retry.status_forcelist),
        };
        if let Some(code) = retry
            .status_forcelist
            .iter()
            .find(|code| !(500..=599).contains(*code))
        {
            return Err(RdaError::ConfigParse(format!(
                "retry.status_forcelist may only contain 5xx codes, got {code}"
            )));
        }

        let completed = config
            .completed_status
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.status.completed);
        if completed.is_empty() {
            return Err(RdaError::ConfigParse(
                "completed_status must not be empty".to_string(),
            ));
        }
        let errors = config
            .error_statuses
            .map(non_empty)
            .unwrap_or(defaults.status.errors);

        let archive_extensions = config
            .archive_extensions
            .map(|values| {
                non_empty(values)
                    .into_iter()
                    .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or(defaults.archive_extensions);
        if let Some(ext) = archive_extensions
            .iter()
            .find(|ext| !SUPPORTED_ARCHIVES.contains(&ext.as_str()))
        {
            return Err(RdaError::ConfigParse(format!(
                "unsupported archive extension: {ext}"
            )));
        }

        Ok(PipelineConfig {
            api_base_url: config
                .api_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
            login_url: config.login_url.unwrap_or(defaults.login_url),
            poll_interval: config
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry,
            status: StatusRules { completed, errors },
            ignore_suffixes: config
                .ignore_suffixes
                .map(non_empty)
                .unwrap_or(defaults.ignore_suffixes),
            archive_extensions,
            path_identity: config.path_identity.unwrap_or(defaults.path_identity),
        })
    }
}

pub const SUPPORTED_ARCHIVES: &[&str] = &["tar", "tar.gz", "tgz", "zip"];

pub fn default_ignore_suffixes() -> Vec<String> {
    vec![".csh".to_string()]
}

pub fn default_archive_extensions() -> Vec<String> {
    vec!["tar".to_string()]
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .collect()
}

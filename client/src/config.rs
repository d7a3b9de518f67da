//! Client configuration
//!
//! The `api` section of the configuration file. Everything the engine does
//! not need to know about the remote deployment lives here: addresses,
//! process identifiers and the opaque request templates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// A required configuration field is missing.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The base URL is not an http(s) URL.
    #[error("invalid base_url: {0}")]
    InvalidBaseUrl(String),

    /// A timeout value is out of acceptable range.
    #[error("invalid timeout: {0:?}")]
    InvalidTimeout(Duration),

    /// A template is not a JSON object.
    #[error("template {0} must be a JSON object")]
    InvalidTemplate(&'static str),
}

/// Connection and payload settings for [`HttpFlowService`](crate::HttpFlowService)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service root, e.g. `https://etl.example.com`
    pub base_url: String,

    /// Prefix of per-user database names (`<prefix>_<username>`)
    pub database_prefix: String,

    /// Process that imports the uploaded file
    pub loader_process: String,

    /// Block of the loader process inside a job
    pub loader_block_id: String,

    /// Process run by the secondary job
    pub secondary_process: String,

    /// Event type of the artifact a secondary run produces
    pub artifact_event: String,

    /// Base body for job creation; `label` is filled in per job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_template: Option<serde_json::Value>,

    /// Extra settings merged into the loader block configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader_block_template: Option<serde_json::Value>,

    /// Extra settings merged into the secondary block configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_block_template: Option<serde_json::Value>,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            database_prefix: "ProcessMiningDB".to_string(),
            loader_process: "spm_file_loader_v2".to_string(),
            loader_block_id: "spm_file_loader_v2[0]".to_string(),
            secondary_process: "spm_dashboard_creation_v_0_2".to_string(),
            artifact_event: "DASHBOARD_CREATED".to_string(),
            job_template: None,
            loader_block_template: None,
            secondary_block_template: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Create a config for `base_url` with default identifiers.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set the database name prefix.
    pub fn with_database_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.database_prefix = prefix.into();
        self
    }

    /// Set the job creation template.
    pub fn with_job_template(mut self, template: serde_json::Value) -> Self {
        self.job_template = Some(template);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Block id of the secondary process inside its job
    pub fn secondary_block_id(&self) -> String {
        format!("{}[0]", self.secondary_process)
    }

    /// Absolute URL for a service path; absolute URLs pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField("base_url"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigValidationError::InvalidBaseUrl(self.base_url.clone()));
        }
        if self.database_prefix.is_empty() {
            return Err(ConfigValidationError::MissingField("database_prefix"));
        }
        if self.loader_process.is_empty() {
            return Err(ConfigValidationError::MissingField("loader_process"));
        }
        if self.secondary_process.is_empty() {
            return Err(ConfigValidationError::MissingField("secondary_process"));
        }

        // 1s to 5m
        let connect = self.connect_timeout();
        if connect < Duration::from_secs(1) || connect > Duration::from_secs(300) {
            return Err(ConfigValidationError::InvalidTimeout(connect));
        }

        for (name, template) in [
            ("job_template", &self.job_template),
            ("loader_block_template", &self.loader_block_template),
            ("secondary_block_template", &self.secondary_block_template),
        ] {
            if template.as_ref().is_some_and(|t| !t.is_object()) {
                return Err(ConfigValidationError::InvalidTemplate(name));
            }
        }

        Ok(())
    }
}

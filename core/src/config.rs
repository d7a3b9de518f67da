//! Run configuration types
//!
//! A run is described by one YAML document. Every section has defaults so a
//! minimal file only needs `users` and `input.path`. String values equal to
//! [`ENV_PLACEHOLDER`] are filled from the environment before the document
//! is deserialized (see [`resolve_env_placeholders`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::retry::{Backoff, RetryPolicy};

/// Marker value replaced from the environment
pub const ENV_PLACEHOLDER: &str = "FROM_ENV";

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Actor population and pacing
    pub run: RunSettings,

    /// Input resource and chunking
    pub input: InputSettings,

    /// Per-request retry behaviour
    pub retry: RetrySettings,

    /// Upload and processing windows
    pub upload: UploadSettings,

    /// Optional secondary pipeline
    pub secondary: SecondarySettings,

    /// Consumer actor behaviour
    pub consumer: ConsumerSettings,

    /// Credentials handed out round-robin
    pub users: Vec<Credentials>,
}

/// Actor population and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Number of producer actors
    pub producers: usize,

    /// Number of consumer actors
    pub consumers: usize,

    /// Iterations each producer must complete
    pub iterations_per_actor: u32,

    /// Lower bound of the pause between iterations
    pub think_time_min_ms: u64,

    /// Upper bound of the pause between iterations
    pub think_time_max_ms: u64,

    /// Optional global cap on outbound requests per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,

    /// Prefix for job labels (`<prefix>_<job id>`)
    pub job_label_prefix: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            producers: 1,
            consumers: 0,
            iterations_per_actor: 1,
            think_time_min_ms: 1000,
            think_time_max_ms: 5000,
            requests_per_second: None,
            job_label_prefix: "Tube".to_string(),
        }
    }
}

impl RunSettings {
    /// Think time bounds
    pub fn think_time(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.think_time_min_ms),
            Duration::from_millis(self.think_time_max_ms),
        )
    }
}

/// Input resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Path of the delimited text file to upload
    pub path: String,

    /// Target chunk size in bytes
    pub chunk_size: usize,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            chunk_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-request retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per request, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Ceiling for any single delay
    pub max_delay_ms: u64,

    /// Window for a single attempt
    pub request_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 10_000,
            request_timeout_secs: 30,
        }
    }
}

impl RetrySettings {
    /// Exponential request policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Backoff::Exponential,
        )
    }

    /// Default per-attempt timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Upload and processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Window for a single chunk transfer attempt
    pub chunk_timeout_secs: u64,

    /// Chunk-level attempts, each wrapping a full request retry cycle
    pub chunk_attempts: u32,

    /// Linear step between chunk-level attempts
    pub chunk_retry_delay_ms: u64,

    /// Stage timeout for small inputs
    pub timeout_small_secs: u64,

    /// Stage timeout for inputs above `chunk_threshold`
    pub timeout_large_secs: u64,

    /// Chunk count above which the large timeout applies
    pub chunk_threshold: usize,

    /// Pause between status polls
    pub poll_interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: 30,
            chunk_attempts: 3,
            chunk_retry_delay_ms: 1000,
            timeout_small_secs: 300,
            timeout_large_secs: 3600,
            chunk_threshold: 200,
            poll_interval_secs: 5,
        }
    }
}

impl UploadSettings {
    /// Stage timeout for an input of `total_chunks`
    pub fn stage_timeout(&self, total_chunks: usize) -> Duration {
        if total_chunks > self.chunk_threshold {
            Duration::from_secs(self.timeout_large_secs)
        } else {
            Duration::from_secs(self.timeout_small_secs)
        }
    }

    /// Linear chunk-level policy
    pub fn chunk_policy(&self) -> RetryPolicy {
        let step = Duration::from_millis(self.chunk_retry_delay_ms);
        RetryPolicy::new(
            self.chunk_attempts,
            step,
            step.saturating_mul(self.chunk_attempts.max(1)),
            Backoff::Linear,
        )
    }

    /// Per-attempt chunk timeout
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Secondary pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondarySettings {
    /// Run the secondary pipeline after validation
    pub enabled: bool,

    /// Max wait for the secondary run
    pub timeout_secs: u64,

    /// Pause between secondary status polls
    pub poll_interval_secs: u64,

    /// Sub-task whose run id identifies the artifact
    pub artifact_block: String,

    /// Appended to the primary label to name the secondary job
    pub label_suffix: String,
}

impl Default for SecondarySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 600,
            poll_interval_secs: 5,
            artifact_block: "1".to_string(),
            label_suffix: "_PM".to_string(),
        }
    }
}

impl SecondarySettings {
    /// Max wait
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Consumer actor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// How long a consumer waits for the first artifact before giving up
    pub wait_timeout_secs: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 600,
        }
    }
}

impl ConsumerSettings {
    /// Wait window
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl LoadConfig {
    /// Parse from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override the number of producers
    pub fn with_producers(mut self, producers: usize) -> Self {
        self.run.producers = producers;
        self
    }

    /// Override the number of consumers
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.run.consumers = consumers;
        self
    }

    /// Override the per-actor quota
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.run.iterations_per_actor = iterations;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.producers == 0 {
            return Err(ConfigError::InvalidRun(
                "at least one producer is required".into(),
            ));
        }
        if self.run.iterations_per_actor == 0 {
            return Err(ConfigError::InvalidRun(
                "iterations_per_actor must be at least 1".into(),
            ));
        }
        if self.run.think_time_min_ms > self.run.think_time_max_ms {
            return Err(ConfigError::InvalidRun(
                "think_time_min_ms exceeds think_time_max_ms".into(),
            ));
        }
        if let Some(rps) = self.run.requests_per_second {
            if rps <= 0.0 {
                return Err(ConfigError::InvalidRun(
                    "requests_per_second must be positive".into(),
                ));
            }
        }
        if self.input.chunk_size == 0 {
            return Err(ConfigError::InvalidInput(
                "chunk_size must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidRetry(
                "base_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if self.upload.chunk_attempts == 0 {
            return Err(ConfigError::InvalidUpload(
                "chunk_attempts must be at least 1".into(),
            ));
        }
        let upload = &self.upload;
        if upload.poll_interval_secs == 0
            || upload.poll_interval_secs > upload.timeout_small_secs.min(upload.timeout_large_secs)
        {
            return Err(ConfigError::InvalidUpload(
                "poll_interval_secs must be positive and within both stage timeouts".into(),
            ));
        }
        if self.secondary.enabled
            && (self.secondary.poll_interval_secs == 0
                || self.secondary.poll_interval_secs > self.secondary.timeout_secs)
        {
            return Err(ConfigError::InvalidUpload(
                "secondary poll_interval_secs must be positive and within timeout_secs".into(),
            ));
        }
        if self.users.is_empty() {
            return Err(ConfigError::NoUsers);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Document could not be parsed
    #[error("Invalid configuration document: {0}")]
    Parse(String),

    /// Placeholder without a matching environment variable
    #[error("Environment variable {0} is required by the configuration but not set")]
    MissingEnv(&'static str),

    /// Invalid run section
    #[error("Invalid run settings: {0}")]
    InvalidRun(String),

    /// Invalid input section
    #[error("Invalid input settings: {0}")]
    InvalidInput(String),

    /// Invalid retry section
    #[error("Invalid retry settings: {0}")]
    InvalidRetry(String),

    /// Invalid upload or secondary section
    #[error("Invalid upload settings: {0}")]
    InvalidUpload(String),

    /// No credentials configured
    #[error("At least one user must be configured")]
    NoUsers,
}

/// How a placeholder value is spliced back into the document
#[derive(Clone, Copy)]
enum Splice {
    Text,
    Number,
}

/// Placeholder locations: (section, key, environment variable)
const ENV_BINDINGS: &[(&str, &str, &str, Splice)] = &[
    ("api", "base_url", "BASE_URL", Splice::Text),
    ("input", "path", "CSV_FILE_PATH", Splice::Text),
    ("run", "iterations_per_actor", "MAX_ITERATIONS", Splice::Number),
];

/// Replace `FROM_ENV` values with environment lookups
///
/// Works on the untyped document so sections owned by other crates (such as
/// `api`) are covered too. Every user password set to the placeholder is
/// filled from `PASSWORD`.
pub fn resolve_env_placeholders<F>(doc: &mut serde_yaml::Value, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (section, key, var, splice) in ENV_BINDINGS {
        let Some(slot) = doc.get_mut(*section).and_then(|s| s.get_mut(*key)) else {
            continue;
        };
        if is_placeholder(slot) {
            let raw = lookup(var).ok_or(ConfigError::MissingEnv(*var))?;
            *slot = splice_value(&raw, *splice)
                .ok_or_else(|| ConfigError::Parse(format!("{var} must be a number, got {raw:?}")))?;
        }
    }

    if let Some(users) = doc.get_mut("users").and_then(|u| u.as_sequence_mut()) {
        for user in users {
            if let Some(slot) = user.get_mut("password") {
                if is_placeholder(slot) {
                    let raw = lookup("PASSWORD").ok_or(ConfigError::MissingEnv("PASSWORD"))?;
                    *slot = serde_yaml::Value::String(raw);
                }
            }
        }
    }

    Ok(())
}

fn is_placeholder(value: &serde_yaml::Value) -> bool {
    value.as_str() == Some(ENV_PLACEHOLDER)
}

fn splice_value(raw: &str, splice: Splice) -> Option<serde_yaml::Value> {
    match splice {
        Splice::Text => Some(serde_yaml::Value::String(raw.to_string())),
        Splice::Number => raw.trim().parse::<u64>().ok().map(serde_yaml::Value::from),
    }
}

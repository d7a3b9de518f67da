//! Configuration file loading

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use flowload_client::ClientConfig;
use flowload_core::config::resolve_env_placeholders;
use flowload_core::LoadConfig;

/// Everything one configuration file describes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine sections (`run`, `input`, `retry`, `upload`, ...)
    #[serde(flatten)]
    pub load: LoadConfig,

    /// Remote service settings
    #[serde(default)]
    pub api: ClientConfig,
}

impl AppConfig {
    /// Load `path`, resolving `FROM_ENV` placeholders from the process
    /// environment after reading `.env`
    pub fn load(path: &Path) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            tracing::debug!(path = %env_file.display(), "Loaded .env");
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml_with(&text, |var| std::env::var(var).ok())
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse YAML text, resolving placeholders through `lookup`
    pub fn from_yaml_with<F>(text: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut doc: serde_yaml::Value =
            serde_yaml::from_str(text).context("Config is not valid YAML")?;
        resolve_env_placeholders(&mut doc, lookup)?;
        let config = serde_yaml::from_value(doc).context("Config does not match the schema")?;
        Ok(config)
    }

    /// Validate both the engine and the client sections
    pub fn validate(&self) -> Result<()> {
        self.load.validate()?;
        self.api.validate()?;
        Ok(())
    }
}

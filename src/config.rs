//! Configuration loader and validator for the journal publication synchronizer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub api: Api,
    pub storage: Storage,
    pub media: Media,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_register_interval_ms")]
    pub register_interval_ms: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_failed_passes")]
    pub max_failed_passes: u32,
}

fn default_register_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_max_failed_passes() -> u32 {
    5
}

/// Remote publication API (GraphQL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub endpoint: String,
    pub token: String,
}

/// Blob storage used for route assets and thumbnails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub base_url: String,
    pub token: String,
}

/// Local media library settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub library_dir: String,
}

impl App {
    /// Data dir with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_millis(self.register_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Media {
    pub fn resolved_library_dir(&self) -> String {
        expand_home(&self.library_dir)
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins; otherwise a sqlite file inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/polog.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.register_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.register_interval_ms must be > 0"));
    }
    if cfg.app.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_seconds must be > 0"));
    }

    if reqwest::Url::parse(cfg.api.endpoint.trim()).is_err() {
        return Err(ConfigError::Invalid("api.endpoint must be a valid URL"));
    }
    if cfg.api.token.trim().is_empty() {
        return Err(ConfigError::Invalid("api.token must be non-empty"));
    }

    if reqwest::Url::parse(cfg.storage.base_url.trim()).is_err() {
        return Err(ConfigError::Invalid("storage.base_url must be a valid URL"));
    }
    if cfg.storage.token.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.token must be non-empty"));
    }

    if cfg.media.library_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("media.library_dir must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  register_interval_ms: 5000
  request_timeout_seconds: 30
  max_failed_passes: 5

api:
  endpoint: "https://api.polog.example/graphql"
  token: "YOUR_API_TOKEN"

storage:
  base_url: "https://storage.polog.example/"
  token: "YOUR_STORAGE_TOKEN"

media:
  library_dir: "./media"
"#
}

//! Configuration loader and validator for the sync service.
use crate::sync_map::SchemaConstraints;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Environment variable overriding `remote.access_token`.
pub const ACCESS_TOKEN_ENV: &str = "LIFELOCK_ACCESS_TOKEN";

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
    pub remote: Remote,
    /// Uniqueness constraints of the remote tables; defaults to the
    /// production LifeLock schema.
    #[serde(default = "SchemaConstraints::lifelock")]
    pub schema: SchemaConstraints,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_attempts: u32,
}

/// Supabase REST endpoint and credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub url: String,
    pub anon_key: String,
    /// Bearer token derived from the Clerk session.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Talk to the database as the anon role, relying on `dev_bypass`
    /// row-level-security policies. Development only.
    #[serde(default)]
    pub dev_bypass: bool,
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("url", &self.url)
            .field("dev_bypass", &self.dev_bypass)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL of the local cache, unless `DATABASE_URL` is set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/lifelock.db", self.app.data_dir))
    }

    /// Token sent as `Authorization: Bearer`. The environment wins over the
    /// file; `dev_bypass` falls back to the anon key.
    pub fn bearer_token(&self) -> Option<String> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .or_else(|| self.remote.access_token.clone())
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.remote.dev_bypass.then(|| self.remote.anon_key.clone()))
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    let url = cfg.remote.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Invalid("remote.url must be non-empty"));
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ConfigError::Invalid("remote.url must be an http(s) URL"));
    }
    if cfg.remote.anon_key.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.anon_key must be non-empty"));
    }
    if cfg.schema.tables.is_empty() {
        return Err(ConfigError::Invalid("schema must declare at least one table"));
    }

    Ok(())
}

/// Sample configuration with every key present.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 5000
  max_backoff_seconds: 300
  max_attempts: 5

remote:
  url: "https://YOUR_PROJECT.supabase.co"
  anon_key: "YOUR_SUPABASE_ANON_KEY"
  access_token: null
  dev_bypass: false

schema:
  light_work_tasks:
    primary_key: [id]
  deep_work_tasks:
    primary_key: [id]
  daily_routines:
    primary_key: [id]
    unique:
      - [user_id, date, routine_type]
  daily_reflections:
    primary_key: [id]
    unique:
      - [user_id, date]
  wellness_tracking:
    primary_key: [id]
    unique:
      - [user_id, date]
  time_blocks:
    primary_key: [id]
    unique:
      - [user_id, date, start_time]
"#
}

//! Client config: the `~/.offgrid/config.yaml` file and the resolved [`ClientConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::engine::RetryPolicy;

pub const DEFAULT_HOST: &str = "http://localhost:11611";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_LOADING_POLL_MS: u64 = 500;
const DEFAULT_DOWNLOAD_POLL_MS: u64 = 1000;

/// Server section (host, api_key, timeout_secs, keep_alive).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<bool>,
}

/// Retry section (max_attempts, base_delay_ms).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
}

/// Chat defaults (model, system).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ChatSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// Full config file.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub chat: ChatSection,
}

/// Returns the default config file path: `~/.offgrid/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".offgrid").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    Ok(std::fs::write(path, contents)?)
}

/// Config load/save error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Connection settings for one client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub keep_alive: bool,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Cadence for loading-progress and cache-stats polls.
    pub poll_interval: Duration,
    pub download_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HOST.to_string(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            keep_alive: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_LOADING_POLL_MS),
            download_poll_interval: Duration::from_millis(DEFAULT_DOWNLOAD_POLL_MS),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str) -> Self {
        Self {
            base_url: normalize_host(host),
            ..Self::default()
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub fn poll_intervals(mut self, loading: Duration, download: Duration) -> Self {
        self.poll_interval = loading;
        self.download_poll_interval = download;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_delay)
    }
}

impl From<&Config> for ClientConfig {
    fn from(c: &Config) -> Self {
        let mut cfg = ClientConfig::new(c.server.host.as_deref().unwrap_or(DEFAULT_HOST));
        cfg.api_key = c.server.api_key.clone().filter(|k| !k.trim().is_empty());
        if let Some(secs) = c.server.timeout_secs {
            cfg.timeout = Duration::from_secs(secs);
        }
        if let Some(keep_alive) = c.server.keep_alive {
            cfg.keep_alive = keep_alive;
        }
        if let Some(n) = c.retry.max_attempts {
            cfg.max_attempts = n;
        }
        if let Some(ms) = c.retry.base_delay_ms {
            cfg.retry_delay = Duration::from_millis(ms);
        }
        cfg
    }
}

/// `host:port` → `http://host:port`, trailing slashes dropped.
fn normalize_host(host: &str) -> String {
    let t = host.trim().trim_end_matches('/');
    if t.is_empty() {
        return DEFAULT_HOST.to_string();
    }
    if t.starts_with("http://") || t.starts_with("https://") {
        t.to_string()
    } else {
        format!("http://{t}")
    }
}

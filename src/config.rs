//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/backhaul/config.toml` following
//! the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/backhaul/` (~/.config/backhaul/)
//! - Data: `$XDG_DATA_HOME/backhaul/` (~/.local/share/backhaul/)
//! - State/Logs: `$XDG_STATE_HOME/backhaul/` (~/.local/state/backhaul/)

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::ApiMethod;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Identity reported with every replayed session
    #[serde(default)]
    pub client: ClientInfo,

    /// Collector API endpoints
    #[serde(default)]
    pub api: ApiConfig,

    /// Backlog timing knobs
    #[serde(default)]
    pub backlog: BacklogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device and application identity stamped onto replayed payloads
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientInfo {
    /// Server-assigned device UUID
    #[serde(default)]
    pub device_uuid: String,

    /// Application version string
    #[serde(default)]
    pub app_version: String,
}

/// Collector API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Customer slug used in the live base URL
    pub client_name: Option<String>,

    /// Route calls to the shared sandbox instead of the live collector
    #[serde(default)]
    pub sandbox: bool,

    /// Live base URL template; `{client}` is replaced with `client_name`
    #[serde(default = "default_live_url")]
    pub live_url: String,

    /// Sandbox base URL
    #[serde(default = "default_sandbox_url")]
    pub sandbox_url: String,

    /// API version segment in endpoint paths
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            client_name: None,
            sandbox: false,
            live_url: default_live_url(),
            sandbox_url: default_sandbox_url(),
            api_version: default_api_version(),
        }
    }
}

fn default_live_url() -> String {
    "https://{client}.dataspin.io".to_string()
}

fn default_sandbox_url() -> String {
    "https://sandbox.dataspin.io".to_string()
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl ApiConfig {
    /// Base URL for the configured environment
    pub fn base_url(&self) -> Result<String> {
        if self.sandbox {
            return Ok(self.sandbox_url.trim_end_matches('/').to_string());
        }
        let client_name = self
            .client_name
            .as_deref()
            .ok_or_else(|| Error::Config("api.client_name is required outside sandbox".to_string()))?;
        Ok(self
            .live_url
            .replace("{client}", client_name)
            .trim_end_matches('/')
            .to_string())
    }

    /// Full endpoint URL for an API method
    pub fn url_for(&self, method: ApiMethod) -> Result<String> {
        let path = match method {
            ApiMethod::RegisterUser => "register_user",
            ApiMethod::RegisterDevice => "register_user_device",
            ApiMethod::StartSession => "start_session",
            ApiMethod::RegisterOldSession => "register_old_session",
            ApiMethod::EndSession => "end_session",
            ApiMethod::RegisterEvent => "register_event",
            ApiMethod::PurchaseItem => "purchase",
            ApiMethod::GetItems => "items",
            ApiMethod::AlivePing => "alive",
        };
        Ok(format!(
            "{}/api/{}/{}/",
            self.base_url()?,
            self.api_version,
            path
        ))
    }
}

/// Backlog timing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BacklogConfig {
    /// Quiet period before dirty state is flushed to disk, in milliseconds
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,

    /// Offline-session duration tick interval in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Per-replay-task timeout in seconds; a task that exceeds it is
    /// reported failed and stays queued
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        BacklogConfig {
            flush_debounce_ms: default_flush_debounce_ms(),
            tick_interval_secs: default_tick_interval_secs(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl BacklogConfig {
    pub fn flush_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_flush_debounce_ms() -> u64 {
    1000
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/backhaul/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("backhaul").join("config.toml")
    }

    /// Data directory (the SQLite-backed store lives here)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("backhaul")
    }

    /// State directory (logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("backhaul")
    }

    /// Default path of the persistent backlog store
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("backlog.db")
    }

    /// Log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("backhaul.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backlog.flush_debounce_ms, 1000);
        assert_eq!(config.backlog.tick_interval_secs, 10);
        assert_eq!(config.backlog.task_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
        assert!(!config.api.sandbox);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
device_uuid = "dev-123"
app_version = "1.4.2"

[api]
client_name = "hyperbees"
sandbox = false

[backlog]
flush_debounce_ms = 250
task_timeout_secs = 5

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.device_uuid, "dev-123");
        assert_eq!(config.api.client_name.as_deref(), Some("hyperbees"));
        assert_eq!(config.backlog.flush_debounce_ms, 250);
        assert_eq!(
            config.backlog.task_timeout(),
            std::time::Duration::from_secs(5)
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_url_for_method() {
        let api = ApiConfig {
            client_name: Some("hyperbees".to_string()),
            ..Default::default()
        };
        assert_eq!(
            api.url_for(ApiMethod::RegisterOldSession).unwrap(),
            "https://hyperbees.dataspin.io/api/v1/register_old_session/"
        );
        assert_eq!(
            api.url_for(ApiMethod::PurchaseItem).unwrap(),
            "https://hyperbees.dataspin.io/api/v1/purchase/"
        );
        assert_eq!(
            api.url_for(ApiMethod::RegisterEvent).unwrap(),
            "https://hyperbees.dataspin.io/api/v1/register_event/"
        );
    }

    #[test]
    fn test_sandbox_url_ignores_client_name() {
        let api = ApiConfig {
            sandbox: true,
            ..Default::default()
        };
        assert_eq!(
            api.url_for(ApiMethod::StartSession).unwrap(),
            "https://sandbox.dataspin.io/api/v1/start_session/"
        );
    }

    #[test]
    fn test_live_requires_client_name() {
        let api = ApiConfig::default();
        assert!(api.base_url().is_err());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::check::error::ConfigError;
use crate::check::rate_limiter::RateLimitConfig;

// =============================================================================
// Time-related constants
// =============================================================================

/// Length of the sliding request window used by the rate limiter
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Default timeout for a single registry HTTP request in milliseconds (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Limits
// =============================================================================

/// Maximum concurrent outbound registry calls across all registries
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 10;

/// Page size requested from tag listing endpoints
pub const TAG_PAGE_SIZE: usize = 100;

/// Default upper bound on pages followed when listing tags
pub const MAX_TAG_PAGES: usize = 10;

/// Engine configuration structure
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Global prerelease default for containers without an override
    pub include_prereleases: bool,
    pub global_concurrency: usize,
    /// Whether registries with a direct "latest" query also list every tag
    pub collect_all_tags: bool,
    /// Registry HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Pages followed when listing tags, [`TAG_PAGE_SIZE`] tags each
    pub max_tag_pages: usize,
    /// Per-registry overrides of the built-in rate limits
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            include_prereleases: false,
            global_concurrency: DEFAULT_GLOBAL_CONCURRENCY,
            collect_all_tags: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_tag_pages: MAX_TAG_PAGES,
            rate_limits: HashMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from `path`, or from the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = config_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub json: bool,
    /// Also write logs to [`log_path`]
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
        }
    }
}

/// Returns the path to the config file.
/// Uses $XDG_CONFIG_HOME/tagscope/config.json if XDG_CONFIG_HOME is set,
/// otherwise falls back to ~/.config/tagscope/config.json.
pub fn config_path() -> PathBuf {
    config_dir_with_env(std::env::var("XDG_CONFIG_HOME").ok(), dirs::home_dir())
        .join("config.json")
}

/// Returns the path to the data directory for tagscope.
/// Uses $XDG_DATA_HOME/tagscope if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/tagscope,
/// or ./tagscope if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("tagscope.log")
}

fn config_dir_with_env(xdg_config_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    xdg_config_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagscope")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("tagscope")
}

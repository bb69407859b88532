//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./leadflow.toml or ./.leadflow/config.toml
//! 2. User config: ~/.leadflow/config.toml
//! 3. System config: /etc/leadflow/config.toml
//! 4. Built-in defaults
//!
//! The API token may always be overridden via the `LEADFLOW_API_TOKEN`
//! environment variable.

use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration for a [`BatchClient`](crate::batch::BatchClient).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadflowConfig {
    pub crm: CrmConfig,
    pub batch: BatchConfig,
    pub rate_limit: RateLimitConfig,
}

/// Connection settings for the CRM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_token: String,
    pub location_id: String,
    /// Value of the provider's `Version` header.
    pub api_version: String,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub tcp_keepalive: Duration,
}

/// Accumulation and dispatch settings for the background processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum requests per dispatched chunk.
    pub batch_size: usize,
    /// Interval between background drain cycles.
    pub accumulation_window: Duration,
    /// How long a dedup-index entry stays valid.
    pub dedup_window: Duration,
    /// Total queued-request cap; submissions beyond it are rejected.
    pub max_pending: usize,
    /// Grace period for in-flight chunks during shutdown.
    pub shutdown_grace: Duration,
    /// TTL for cached per-tenant sync summaries.
    pub summary_cache_ttl: Duration,
}

impl BatchConfig {
    /// Default bound on a caller's wait for its result: two accumulation
    /// windows (worst-case queueing plus dispatch) plus a fixed margin.
    pub fn result_wait(&self) -> Duration {
        self.accumulation_window * 2 + Duration::from_secs(30)
    }
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls admitted per rolling window. The provider advertises ~300/min;
    /// stay strictly below it.
    pub max_requests: usize,
    pub window: Duration,
    /// Extra sleep added when waiting for the window to free a slot.
    pub margin: Duration,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://services.leadconnectorhq.com".to_string(),
            api_token: String::new(),
            location_id: String::new(),
            api_version: "2021-07-28".to_string(),
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 100,
            pool_idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            accumulation_window: Duration::from_millis(2000),
            dedup_window: Duration::from_secs(30),
            max_pending: 10_000,
            shutdown_grace: Duration::from_secs(10),
            summary_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 280,
            window: Duration::from_secs(60),
            margin: Duration::from_millis(100),
        }
    }
}

/// Problems loading or persisting a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl LeadflowConfig {
    /// Parse a TOML config file. Errors carry the offending path.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write this configuration out as pretty-printed TOML.
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides (currently just the API token).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std_env::var("LEADFLOW_API_TOKEN") {
            if !token.is_empty() {
                self.crm.api_token = token;
            }
        }
        self
    }
}

const PROJECT_FILE: &str = "leadflow.toml";
const DOT_DIR: &str = ".leadflow";
const NESTED_FILE: &str = "config.toml";

/// Locates the active configuration file on the search path.
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the nearest config on the search path, or defaults when no
    /// file exists. Environment overrides apply either way.
    pub fn load() -> Result<LeadflowConfig, ConfigError> {
        let config = match Self::locate() {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                LeadflowConfig::from_toml_file(&path)?
            }
            None => {
                debug!("no configuration file on the search path, using defaults");
                LeadflowConfig::default()
            }
        };
        Ok(config.with_env_overrides())
    }

    /// First existing file on the search path, if any.
    pub fn locate() -> Option<PathBuf> {
        Self::candidates().into_iter().find(|p| p.is_file())
    }

    /// Search path, most specific first: the working directory's
    /// `leadflow.toml` and `.leadflow/config.toml`, then the same dot
    /// directory under the home directory, then the system-wide file.
    pub fn candidates() -> Vec<PathBuf> {
        let cwd = std_env::current_dir().ok();
        let home = std_env::var_os("HOME")
            .or_else(|| std_env::var_os("USERPROFILE"))
            .map(PathBuf::from);

        cwd.into_iter()
            .flat_map(|dir| [dir.join(PROJECT_FILE), dir.join(DOT_DIR).join(NESTED_FILE)])
            .chain(home.map(|dir| dir.join(DOT_DIR).join(NESTED_FILE)))
            .chain(cfg!(unix).then(|| PathBuf::from("/etc/leadflow").join(NESTED_FILE)))
            .collect()
    }
}

//! Centralized configuration for the request pipeline.
//!
//! Compile-time defaults live on the unit structs as associated constants.
//! `ClientConfig` is the runtime, file-loadable configuration built from them.

use crate::cache::CacheConfig;
use crate::network::RetryConfig;
use crate::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network-related defaults.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    pub const USER_AGENT: &'static str = concat!("ferrylink/", env!("CARGO_PKG_VERSION"));
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    /// Tracked transfer statuses before finished ones are forgotten.
    pub const DOWNLOAD_STATUS_CAPACITY: usize = 256;
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const OFFLINE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);
    pub const ONLINE_VERIFY_INTERVAL: Duration = Duration::from_secs(300);
}

/// Cache tier defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const MEMORY_CAPACITY: u64 = 512;
    /// Freshness window for responses written by the pipeline (5 minutes).
    pub const PERSISTENT_TTL: Duration = Duration::from_secs(300);
}

/// On-disk layout under the data directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "ferrylink";
    pub const CACHE_DB_FILENAME: &'static str = "cache.db";
    pub const OFFLINE_QUEUE_FILENAME: &'static str = "offline_queue.json";
    pub const DOWNLOADS_DIR_NAME: &'static str = "downloads";

    /// Default root for ferrylink's files (`$XDG_CACHE_HOME/ferrylink`).
    pub fn default_root() -> Result<PathBuf> {
        let base = dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
            .ok_or_else(|| FerryError::Config {
                message: "Could not determine cache directory".to_string(),
            })?;
        Ok(base.join(Self::APP_DIR_NAME))
    }
}

/// Runtime configuration for a [`RequestPipeline`](crate::RequestPipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClientConfig {
    /// Base URL that request paths are resolved against.
    pub base_url: Option<String>,
    /// Headers added to every request unless the request sets them itself.
    pub default_headers: BTreeMap<String, String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    /// Where the offline queue is persisted (`None` keeps it in memory only).
    pub offline_queue_path: Option<PathBuf>,
    /// Where download resume tokens are persisted.
    pub download_state_dir: Option<PathBuf>,
    /// Endpoint that issues fresh bearer tokens.
    pub refresh_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: BTreeMap::new(),
            timeout: NetworkConfig::REQUEST_TIMEOUT,
            user_agent: NetworkConfig::USER_AGENT.to_string(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            offline_queue_path: None,
            download_state_dir: None,
            refresh_url: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    ///
    /// Fields missing from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| FerryError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        let config: ClientConfig = serde_json::from_str(&contents).map_err(|e| FerryError::Config {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Fill unset storage locations with paths under `root`.
    pub fn with_storage_root(mut self, root: &Path) -> Self {
        if self.cache.database_path.is_none() {
            self.cache.database_path = Some(root.join(PathsConfig::CACHE_DB_FILENAME));
        }
        if self.offline_queue_path.is_none() {
            self.offline_queue_path = Some(root.join(PathsConfig::OFFLINE_QUEUE_FILENAME));
        }
        if self.download_state_dir.is_none() {
            self.download_state_dir = Some(root.join(PathsConfig::DOWNLOADS_DIR_NAME));
        }
        self
    }

    /// Reject configurations that would fail later in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if let Some(base) = &self.base_url {
            url::Url::parse(base).map_err(|e| FerryError::Config {
                message: format!("Invalid base_url '{}': {}", base, e),
            })?;
        }
        if let Some(refresh) = &self.refresh_url {
            url::Url::parse(refresh).map_err(|e| FerryError::Config {
                message: format!("Invalid refresh_url '{}': {}", refresh, e),
            })?;
        }
        if self.cache.memory_capacity == 0 {
            return Err(FerryError::Config {
                message: "cache.memory_capacity must be greater than zero".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(FerryError::Config {
                message: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Serialize `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Same as [`duration_secs`] for optional durations.
pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "duration must be a non-negative number",
            )),
            Some(s) => Ok(Some(Duration::from_secs_f64(s))),
            None => Ok(None),
        }
    }
}

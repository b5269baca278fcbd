//! Configuration management.
//!
//! Configuration is stored at `~/.config/eventcache/config.json`. Every field
//! has a default, so a missing file (or missing keys) is fine. Environment
//! variables prefixed with `EVENTCACHE_` override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "eventcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_TTL_HOURS: u64 = 6;
const DEFAULT_REFRESH_INTERVAL_HOURS: u64 = 4;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 4;
const DEFAULT_MAX_PAGES: u32 = 3;
const DEFAULT_REMOTE_COLLECTION: &str = "event_cache";

/// Upper bound for hour-valued settings (ten years)
const MAX_HOURS: u64 = 24 * 365 * 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Entries younger than this are served without a refresh.
    pub ttl_hours: u64,
    /// Local disk tier directory. Defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub refresh_interval_hours: u64,
    /// Fire scheduled cycles at multiples of the interval since UTC midnight.
    pub align_refresh: bool,
    pub sweep_after_refresh: bool,
    pub fetch_timeout_secs: u64,
    pub max_concurrent_refreshes: usize,
    pub source: SourceConfig,
    /// Shared remote tier. `None` runs with memory and disk only.
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub regions: Vec<String>,
    pub categories: Vec<String>,
    pub max_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_collection() -> String {
    DEFAULT_REMOTE_COLLECTION.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_hours: DEFAULT_TTL_HOURS,
            cache_dir: None,
            refresh_interval_hours: DEFAULT_REFRESH_INTERVAL_HOURS,
            align_refresh: false,
            sweep_after_refresh: true,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            source: SourceConfig::default(),
            remote: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            api_token: None,
            regions: vec!["new york".to_string(), "san francisco".to_string()],
            categories: vec!["all".to_string()],
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl Config {
    /// Load the config file (if present) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_json(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `EVENTCACHE_*` overrides. Unparseable numbers are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(hours) = parse_u64("EVENTCACHE_TTL_HOURS") {
            self.ttl_hours = hours;
        }
        if let Some(hours) = parse_u64("EVENTCACHE_REFRESH_INTERVAL_HOURS") {
            self.refresh_interval_hours = hours;
        }
        if let Some(secs) = parse_u64("EVENTCACHE_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = secs;
        }
        if let Some(align) = var("EVENTCACHE_ALIGN_REFRESH") {
            self.align_refresh = matches!(align.trim(), "1" | "true" | "yes");
        }
        if let Some(dir) = var("EVENTCACHE_CACHE_DIR").filter(|s| !s.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = var("EVENTCACHE_SOURCE_URL").filter(|s| !s.is_empty()) {
            self.source.base_url = url;
        }
        if let Some(token) = var("EVENTCACHE_SOURCE_TOKEN").filter(|s| !s.is_empty()) {
            self.source.api_token = Some(token);
        }
        if let Some(url) = var("EVENTCACHE_REMOTE_URL").filter(|s| !s.is_empty()) {
            let remote = self.remote.get_or_insert_with(|| RemoteConfig {
                base_url: String::new(),
                collection: default_collection(),
                api_token: None,
            });
            remote.base_url = url;
        }
        if let Some(token) = var("EVENTCACHE_REMOTE_TOKEN").filter(|s| !s.is_empty()) {
            if let Some(remote) = self.remote.as_mut() {
                remote.api_token = Some(token);
            }
        }
    }

    /// Directory for the disk tier, falling back to the platform cache dir.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours.min(MAX_HOURS) as i64)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_hours.clamp(1, MAX_HOURS) * 3600)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

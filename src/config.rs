//! Runtime configuration for the shortlink client

use crate::cache::CacheTtl;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "SHORTLINK_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON file holding the persisted user settings
    pub settings_path: PathBuf,

    /// JSON file holding the transient link/selection handoff
    pub handoff_path: PathBuf,

    /// Deadline for a shortening request
    pub shorten_timeout: Duration,

    /// Deadline for a connection test
    pub test_timeout: Duration,

    /// Deadline for a dashboard (db-stats) fetch
    pub dashboard_timeout: Duration,

    /// Deadline for an analytics (stats) fetch
    pub analytics_timeout: Duration,

    /// How long a dashboard payload is served from cache
    pub dashboard_ttl: Duration,

    /// How long an analytics payload is served from cache
    pub analytics_ttl: Duration,

    /// `filter` sent with analytics queries (top, bottom, rand, last)
    pub analytics_filter: String,

    /// `limit` sent with analytics queries
    pub analytics_limit: u32,

    /// Capacity of the relay request queue
    pub relay_queue_depth: usize,
}

fn state_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("shortlink");
    }
    if let Some(home) = env::var_os("HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(home).join(".config").join("shortlink");
    }
    PathBuf::from(".shortlink")
}

impl Default for Config {
    fn default() -> Self {
        let dir = state_dir();
        Self {
            settings_path: dir.join("settings.json"),
            handoff_path: dir.join("handoff.json"),
            shorten_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(15),
            dashboard_timeout: Duration::from_secs(10),
            analytics_timeout: Duration::from_secs(20),
            dashboard_ttl: Duration::from_secs(30),
            analytics_ttl: Duration::from_secs(300),
            analytics_filter: "top".to_string(),
            analytics_limit: 10,
            relay_queue_depth: 64,
        }
    }
}

impl Config {
    /// Load configuration from `SHORTLINK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));
        let seconds = |suffix: &str| {
            var(suffix)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        if let Some(path) = var("SETTINGS_PATH") {
            config.settings_path = PathBuf::from(path);
        }

        if let Some(path) = var("HANDOFF_PATH") {
            config.handoff_path = PathBuf::from(path);
        }

        if let Some(timeout) = seconds("SHORTEN_TIMEOUT_SECONDS") {
            config.shorten_timeout = timeout;
        }

        if let Some(timeout) = seconds("TEST_TIMEOUT_SECONDS") {
            config.test_timeout = timeout;
        }

        if let Some(timeout) = seconds("DASHBOARD_TIMEOUT_SECONDS") {
            config.dashboard_timeout = timeout;
        }

        if let Some(timeout) = seconds("ANALYTICS_TIMEOUT_SECONDS") {
            config.analytics_timeout = timeout;
        }

        if let Some(ttl) = seconds("DASHBOARD_TTL_SECONDS") {
            config.dashboard_ttl = ttl;
        }

        if let Some(ttl) = seconds("ANALYTICS_TTL_SECONDS") {
            config.analytics_ttl = ttl;
        }

        if let Some(filter) = var("ANALYTICS_FILTER") {
            config.analytics_filter = filter.trim().to_lowercase();
        }

        if let Some(limit) = var("ANALYTICS_LIMIT").and_then(|v| v.trim().parse().ok()) {
            config.analytics_limit = limit;
        }

        if let Some(depth) = var("RELAY_QUEUE_DEPTH").and_then(|v| v.trim().parse().ok()) {
            config.relay_queue_depth = depth;
        }

        config
    }

    pub fn cache_ttl(&self) -> CacheTtl {
        CacheTtl {
            dashboard: self.dashboard_ttl,
            analytics: self.analytics_ttl,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.settings_path.as_os_str().is_empty() {
            return Err("settings_path cannot be empty".to_string());
        }

        if self.handoff_path.as_os_str().is_empty() {
            return Err("handoff_path cannot be empty".to_string());
        }

        for (name, timeout) in [
            ("shorten_timeout", self.shorten_timeout),
            ("test_timeout", self.test_timeout),
            ("dashboard_timeout", self.dashboard_timeout),
            ("analytics_timeout", self.analytics_timeout),
        ] {
            if timeout.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        if !matches!(
            self.analytics_filter.as_str(),
            "top" | "bottom" | "rand" | "last"
        ) {
            return Err(format!(
                "analytics_filter must be one of top, bottom, rand, last (got '{}')",
                self.analytics_filter
            ));
        }

        if self.analytics_limit == 0 {
            return Err("analytics_limit must be greater than 0".to_string());
        }

        if self.relay_queue_depth == 0 {
            return Err("relay_queue_depth must be greater than 0".to_string());
        }

        Ok(())
    }
}

//! Runtime configuration.
//!
//! Environment variables (via `dotenv` + `std::env`, grounded on the
//! teacher's `models::Config::from_env`) supply the connection-level
//! basics; an optional TOML file (grounded on
//! `performance::config::PerfConfig::load`/`from_env`) supplies the
//! tunables for the concurrency pool, filter cache, and scheduler.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyPoolDefaults {
    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_true")]
    pub adaptive: bool,
    #[serde(default = "default_true")]
    pub retry: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_concurrency() -> usize {
    8
}
fn default_min_concurrency() -> usize {
    2
}
fn default_max_concurrency() -> usize {
    12
}
fn default_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for ConcurrencyPoolDefaults {
    fn default() -> Self {
        Self {
            initial_concurrency: default_initial_concurrency(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            adaptive: true,
            retry: true,
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTunables {
    #[serde(default = "default_granularity_hours")]
    pub default_granularity_hours: i64,
    #[serde(default = "default_batch_size")]
    pub window_batch_size: usize,
    #[serde(default = "default_binance_request_delay_ms")]
    pub binance_request_delay_ms: u64,
    #[serde(default = "default_filter_cache_ttl_days")]
    pub filter_cache_ttl_days: i64,
    #[serde(default)]
    pub pool: ConcurrencyPoolDefaults,
}

fn default_granularity_hours() -> i64 {
    8
}
fn default_batch_size() -> usize {
    40
}
fn default_binance_request_delay_ms() -> u64 {
    100
}
fn default_filter_cache_ttl_days() -> i64 {
    30
}

impl Default for EngineTunables {
    fn default() -> Self {
        Self {
            default_granularity_hours: default_granularity_hours(),
            window_batch_size: default_batch_size(),
            binance_request_delay_ms: default_binance_request_delay_ms(),
            filter_cache_ttl_days: default_filter_cache_ttl_days(),
            pool: ConcurrencyPoolDefaults::default(),
        }
    }
}

impl EngineTunables {
    /// Load from a TOML file; fall back to defaults (with a debug log) if
    /// the file is absent or malformed, matching `PerfConfig::from_env`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let tunables: Self = toml::from_str(&contents)?;
        Ok(tunables)
    }

    pub fn from_env() -> Self {
        let path =
            std::env::var("ENGINE_CONFIG_PATH").unwrap_or_else(|_| "engine.toml".to_string());
        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!(path = %path, error = %e, "using default engine tunables");
            Self::default()
        })
    }
}

/// Application configuration, analogous to the teacher's `models::Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub market_feed_base_url: String,
    pub market_feed_timeout_secs: u64,
    pub scheduler_notify_address: Option<String>,
    pub tunables: EngineTunables,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./leaderboard.db".to_string());

        let market_feed_base_url = std::env::var("MARKET_FEED_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let market_feed_timeout_secs = std::env::var("MARKET_FEED_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let scheduler_notify_address = std::env::var("SCHEDULER_NOTIFY_ADDRESS").ok();

        Ok(Self {
            database_path,
            market_feed_base_url,
            market_feed_timeout_secs,
            scheduler_notify_address,
            tunables: EngineTunables::from_env(),
        })
    }
}

//! Store configuration
//!
//! Defaults mirror the production settings; a TOML file and a handful of
//! environment variables can override them.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for [`crate::store::CandleStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Flush candles when the write buffer reaches this size.
    #[serde(default = "default_buffer_size")]
    pub candle_buffer_size: usize,

    /// Flush events when the write buffer reaches this size.
    #[serde(default = "default_buffer_size")]
    pub event_buffer_size: usize,

    /// Max cached candle query results.
    #[serde(default = "default_cache_entries")]
    pub max_candle_cache_entries: usize,

    /// Max cached event query results.
    #[serde(default = "default_cache_entries")]
    pub max_event_cache_entries: usize,

    /// Resolution candles are stored and read at.
    #[serde(default = "default_base_resolution_ms")]
    pub base_resolution_ms: i64,

    /// Row limit applied by `query_candles` / `query_events`.
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,

    /// Upper bound on base candles materialized by gap-filling.
    #[serde(default = "default_max_dense_candles")]
    pub max_dense_candles: u64,

    /// SQLite busy timeout.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Treat cached query results as stale after any successful flush.
    #[serde(default = "default_true")]
    pub invalidate_cache_on_flush: bool,
}

fn default_db_path() -> String {
    "candles.db".to_string()
}

fn default_buffer_size() -> usize {
    50_000
}

fn default_cache_entries() -> usize {
    100
}

fn default_base_resolution_ms() -> i64 {
    1000
}

fn default_query_limit() -> usize {
    10_000
}

fn default_max_dense_candles() -> u64 {
    5_000_000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            candle_buffer_size: default_buffer_size(),
            event_buffer_size: default_buffer_size(),
            max_candle_cache_entries: default_cache_entries(),
            max_event_cache_entries: default_cache_entries(),
            base_resolution_ms: default_base_resolution_ms(),
            default_query_limit: default_query_limit(),
            max_dense_candles: default_max_dense_candles(),
            busy_timeout_ms: default_busy_timeout_ms(),
            invalidate_cache_on_flush: true,
        }
    }
}

impl StoreConfig {
    /// Default settings pointed at `db_path`.
    pub fn with_path(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `CANDLE_STORE_CONFIG` (or `candle_store.toml`), then apply
    /// per-field environment overrides.
    pub fn from_env() -> Self {
        let path = std::env::var("CANDLE_STORE_CONFIG")
            .unwrap_or_else(|_| "candle_store.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default candle store config ({}): {}", path, e);
            Self::default()
        });

        if let Ok(db_path) = std::env::var("CANDLE_STORE_DB_PATH") {
            if !db_path.is_empty() {
                config.db_path = db_path;
            }
        }
        if let Some(n) = env_usize("CANDLE_STORE_CANDLE_BUFFER") {
            config.candle_buffer_size = n;
        }
        if let Some(n) = env_usize("CANDLE_STORE_EVENT_BUFFER") {
            config.event_buffer_size = n;
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.candle_buffer_size > 0, "candle_buffer_size must be positive");
        anyhow::ensure!(self.event_buffer_size > 0, "event_buffer_size must be positive");
        anyhow::ensure!(self.base_resolution_ms > 0, "base_resolution_ms must be positive");
        anyhow::ensure!(self.max_dense_candles > 0, "max_dense_candles must be positive");
        Ok(())
    }
}

fn env_usize(var: &str) -> Option<usize> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.candle_buffer_size, 50_000);
        assert_eq!(config.event_buffer_size, 50_000);
        assert_eq!(config.max_candle_cache_entries, 100);
        assert_eq!(config.max_event_cache_entries, 100);
        assert_eq!(config.base_resolution_ms, 1000);
        assert!(config.invalidate_cache_on_flush);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StoreConfig = toml::from_str(
            r#"
            db_path = "/tmp/run.db"
            candle_buffer_size = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, "/tmp/run.db");
        assert_eq!(config.candle_buffer_size, 100);
        assert_eq!(config.event_buffer_size, 50_000);
        assert_eq!(config.default_query_limit, 10_000);
    }

    #[test]
    fn test_load_rejects_zero_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "event_buffer_size = 0\n").unwrap();
        assert!(StoreConfig::load(&path).is_err());
    }
}

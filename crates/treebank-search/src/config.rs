//! Search configuration, persisted as JSON next to the service state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

pub const SEARCH_CONFIG_FILENAME: &str = "search.json";

/// Checkpoints have to happen at least this often.
pub const MAX_CHECKPOINT_INTERVAL_MS: u64 = 1000;

/// Ten years; longer windows would overflow timestamp arithmetic.
pub const MAX_RECENT_ACTIVITY_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Directory holding one cache file per ShardResult.
    pub cache_dir: PathBuf,
    /// Matches cached per partition; beyond this only counts are gathered.
    pub max_results_per_partition: u64,
    /// Byte budget of the cache directory, in MiB.
    pub max_cache_size_mib: u64,
    pub checkpoint_interval_ms: u64,
    pub engine_timeout_secs: u64,
    /// ShardResults referenced by a query accessed within this window are
    /// never evicted.
    pub recent_activity_hours: i64,
    pub purge_interval_secs: u64,
    pub max_results_per_poll: usize,
    pub max_results_per_analysis_poll: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            max_results_per_partition: 5_000,
            max_cache_size_mib: 256,
            checkpoint_interval_ms: MAX_CHECKPOINT_INTERVAL_MS,
            engine_timeout_secs: 300,
            recent_activity_hours: 24,
            purge_interval_secs: 15 * 60,
            max_results_per_poll: 500,
            max_results_per_analysis_poll: 50_000,
        }
    }
}

impl SearchConfig {
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// `None` when the configured hours do not fit a `TimeDelta`.
    pub fn recent_activity_window(&self) -> Option<TimeDelta> {
        TimeDelta::try_hours(self.recent_activity_hours)
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mib.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_results_per_partition == 0 {
            return Err(SearchError::Config(
                "max_results_per_partition must be positive".to_string(),
            ));
        }
        if self.checkpoint_interval_ms > MAX_CHECKPOINT_INTERVAL_MS {
            return Err(SearchError::Config(format!(
                "checkpoint_interval_ms must be at most {MAX_CHECKPOINT_INTERVAL_MS}"
            )));
        }
        if self.engine_timeout_secs == 0 {
            return Err(SearchError::Config(
                "engine_timeout_secs must be positive".to_string(),
            ));
        }
        if !(0..=MAX_RECENT_ACTIVITY_HOURS).contains(&self.recent_activity_hours) {
            return Err(SearchError::Config(format!(
                "recent_activity_hours must be between 0 and {MAX_RECENT_ACTIVITY_HOURS}"
            )));
        }
        Ok(())
    }
}

pub fn search_config_path(dir: &Path) -> PathBuf {
    dir.join(SEARCH_CONFIG_FILENAME)
}

pub fn load_or_create_search_config(dir: &Path) -> Result<SearchConfig> {
    std::fs::create_dir_all(dir).map_err(|error| {
        SearchError::Config(format!(
            "failed to create config directory {}: {error}",
            dir.display()
        ))
    })?;

    let path = search_config_path(dir);
    if !path.exists() {
        let config = SearchConfig::default();
        write_search_config(&path, &config)?;
        return Ok(config);
    }

    let data = std::fs::read_to_string(&path).map_err(|error| {
        SearchError::Config(format!(
            "failed to read search config {}: {error}",
            path.display()
        ))
    })?;
    let config: SearchConfig = serde_json::from_str(&data).map_err(|error| {
        SearchError::Config(format!(
            "failed to parse search config {}: {error}",
            path.display()
        ))
    })?;
    config.validate()?;
    Ok(config)
}

fn write_search_config(path: &Path, config: &SearchConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config).map_err(|error| {
        SearchError::Config(format!(
            "failed to serialize search config {}: {error}",
            path.display()
        ))
    })?;
    std::fs::write(path, data).map_err(|error| {
        SearchError::Config(format!(
            "failed to write search config {}: {error}",
            path.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_config_when_missing() {
        let dir = tempdir().expect("tempdir");
        let config = load_or_create_search_config(dir.path()).expect("load/create");

        assert!(search_config_path(dir.path()).exists());
        assert_eq!(config, SearchConfig::default());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            search_config_path(dir.path()),
            r#"{ "max_results_per_partition": 7, "cache_dir": "/tmp/x" }"#,
        )
        .expect("write config");

        let config = load_or_create_search_config(dir.path()).expect("load config");
        assert_eq!(config.max_results_per_partition, 7);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.checkpoint_interval_ms, MAX_CHECKPOINT_INTERVAL_MS);
    }

    #[test]
    fn rejects_slow_checkpoints() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            search_config_path(dir.path()),
            r#"{ "checkpoint_interval_ms": 5000 }"#,
        )
        .expect("write config");

        let err = load_or_create_search_config(dir.path()).expect_err("expected error");
        match err {
            SearchError::Config(_) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unbounded_activity_window() {
        let config = SearchConfig {
            recent_activity_hours: 10_000_000_000,
            ..SearchConfig::default()
        };
        assert!(matches!(config.validate(), Err(SearchError::Config(_))));

        let config = SearchConfig {
            recent_activity_hours: MAX_RECENT_ACTIVITY_HOURS,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.recent_activity_window().is_some());
    }

    #[test]
    fn budget_is_in_mebibytes() {
        let config = SearchConfig {
            max_cache_size_mib: 2,
            ..SearchConfig::default()
        };
        assert_eq!(config.max_cache_bytes(), 2 * 1024 * 1024);
    }
}

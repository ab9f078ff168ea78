//! Cache configuration and application paths
//!
//! `CacheConfig` is read from `framecache.json` in the config directory.
//! Missing file means defaults; missing fields fall back individually.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Workers;

pub const CONFIG_FILE: &str = "framecache.json";
pub const LOG_FILE: &str = "framecache.log";
const CONFIG_DIR_ENV: &str = "FRAMECACHE_CONFIG_DIR";
const APP_DIR: &str = "framecache";

const MIB: usize = 1024 * 1024;

/// Tunables of the frame cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Metadata older than this is reloaded before serving a frame
    pub meta_reload_period_secs: u64,
    /// Per-job byte budget of decoded context images
    pub context_budget_mb: usize,
    /// Memory budget that sizes the decoded-chunk ring
    pub decoded_budget_mb: usize,
    /// Upper bound of decoded chunks held per job
    pub max_decoded_blocks: usize,
    /// Worker threads; 3/4 of the CPU cores when absent
    pub workers: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            meta_reload_period_secs: 3600,
            context_budget_mb: 512,
            decoded_budget_mb: 2048,
            max_decoded_blocks: 10,
            workers: None,
        }
    }
}

impl CacheConfig {
    pub fn meta_reload_period(&self) -> Duration {
        Duration::from_secs(self.meta_reload_period_secs)
    }

    pub fn context_budget(&self) -> usize {
        self.context_budget_mb.saturating_mul(MIB)
    }

    pub fn decoded_budget(&self) -> usize {
        self.decoded_budget_mb.saturating_mul(MIB)
    }

    pub fn worker_threads(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .unwrap_or_else(Workers::default_threads)
    }

    /// Load config from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

/// Override of the default application directory
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (FRAMECACHE_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file
///
/// Platform paths:
/// - Linux: ~/.config/framecache/{name}
/// - macOS: ~/Library/Application Support/framecache/{name}
/// - Windows: %APPDATA%\framecache\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Path to a data file (logs)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Create config and data directories if they don't exist
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    if data_dir != config_dir {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    dirs_next::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    dirs_next::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("test.json", &config), PathBuf::from("/custom/test.json"));
        assert_eq!(data_file("cache.log", &config), PathBuf::from("/custom/cache.log"));
    }

    #[test]
    fn test_platform_defaults_contain_app_dir() {
        let path = config_file("test.json", &PathConfig::default());
        assert!(path.to_string_lossy().contains("test.json"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.meta_reload_period(), Duration::from_secs(3600));
        assert_eq!(config.context_budget(), 512 * MIB);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{ "max_decoded_blocks": 4, "workers": 2 }"#).unwrap();
        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.max_decoded_blocks, 4);
        assert_eq!(config.worker_threads(), 2);
        assert_eq!(config.decoded_budget_mb, 2048);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = CacheConfig {
            meta_reload_period_secs: 60,
            ..CacheConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(CacheConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CacheConfig::load(&path).is_err());
    }

    #[test]
    fn test_zero_workers_falls_back() {
        let config = CacheConfig {
            workers: Some(0),
            ..CacheConfig::default()
        };
        assert!(config.worker_threads() >= 1);
    }
}

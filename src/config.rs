//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::SpdbConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Points at an explicit config file, checked before the default locations
pub const CONFIG_ENV: &str = "SPDB_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub spdb: SpdbSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SpdbSection {
    /// Database directory used when the CLI is given none
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_read_lock_timeout")]
    pub read_lock_timeout_ms: u64,

    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,

    #[serde(default)]
    pub allow_no_lock: bool,

    #[serde(default)]
    pub enable_defrag: bool,

    #[serde(default = "default_defrag_min_frag_bytes")]
    pub defrag_min_frag_bytes: u64,

    #[serde(default = "default_defrag_min_fraction")]
    pub defrag_min_fraction: f64,

    #[serde(default = "default_defrag_force_fraction")]
    pub defrag_force_fraction: f64,

    #[serde(default = "default_valid_lookback_days")]
    pub valid_lookback_days: u32,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("spdb").to_string_lossy().to_string())
        .unwrap_or_else(|| "./spdb_data".to_string())
}

fn default_lock_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_read_lock_timeout() -> u64 {
    1000
}

fn default_lock_retry() -> u64 {
    50
}

fn default_defrag_min_frag_bytes() -> u64 {
    10_000
}

fn default_defrag_min_fraction() -> f64 {
    0.05
}

fn default_defrag_force_fraction() -> f64 {
    0.3
}

fn default_valid_lookback_days() -> u32 {
    3
}

impl Default for SpdbSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_timeout_ms: default_lock_timeout(),
            read_lock_timeout_ms: default_read_lock_timeout(),
            lock_retry_ms: default_lock_retry(),
            allow_no_lock: false,
            enable_defrag: false,
            defrag_min_frag_bytes: default_defrag_min_frag_bytes(),
            defrag_min_fraction: default_defrag_min_fraction(),
            defrag_force_fraction: default_defrag_force_fraction(),
            valid_lookback_days: default_valid_lookback_days(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// A loaded configuration and what went wrong while finding it.
///
/// Nothing is logged during discovery, so a binary can install its
/// subscriber from `config.logging` first and then call [`LoadedConfig::log`].
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    /// File the config came from; `None` means built-in defaults
    pub source: Option<PathBuf>,
    /// Candidate files that failed to load, and ignored env overrides
    pub problems: Vec<ConfigError>,
}

impl LoadedConfig {
    pub fn log(&self) {
        match &self.source {
            Some(path) => tracing::info!("Loaded config from {:?}", path),
            None => tracing::debug!("Using default config with environment overrides"),
        }
        for problem in &self.problems {
            tracing::warn!("{}", problem);
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load a file named on the command line, then apply env overrides
    pub fn load_explicit(path: &Path) -> Result<LoadedConfig, ConfigError> {
        let mut config = Self::load(path)?;
        let problems = config.apply_overrides(env_var);
        Ok(LoadedConfig {
            config,
            source: Some(path.to_path_buf()),
            problems,
        })
    }

    /// Load from `SPDB_CONFIG`, the default locations, or the environment
    pub fn discover() -> LoadedConfig {
        let config_paths: Vec<PathBuf> = [
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            dirs::config_dir().map(|p| p.join("spdb").join("config.toml")),
            Some(PathBuf::from("/etc/spdb/config.toml")),
            Some(PathBuf::from("./spdb.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::discover_in(&config_paths, env_var)
    }

    /// First candidate that exists and parses wins
    fn discover_in(paths: &[PathBuf], var: impl Fn(&str) -> Option<String>) -> LoadedConfig {
        let mut problems = Vec::new();
        for path in paths.iter().filter(|p| p.exists()) {
            match Self::load(path) {
                Ok(mut config) => {
                    problems.extend(config.apply_overrides(&var));
                    return LoadedConfig {
                        config,
                        source: Some(path.clone()),
                        problems,
                    };
                }
                Err(e) => problems.push(e),
            }
        }

        let mut config = Config::default();
        problems.extend(config.apply_overrides(&var));
        LoadedConfig {
            config,
            source: None,
            problems,
        }
    }

    /// Engine settings derived from the `[spdb]` section
    pub fn engine_config(&self) -> SpdbConfig {
        let s = &self.spdb;
        SpdbConfig {
            lock_timeout: Duration::from_millis(s.lock_timeout_ms),
            read_lock_timeout: Duration::from_millis(s.read_lock_timeout_ms),
            lock_retry_interval: Duration::from_millis(s.lock_retry_ms.max(1)),
            allow_no_lock: s.allow_no_lock,
            enable_defrag: s.enable_defrag,
            defrag_min_frag_bytes: s.defrag_min_frag_bytes,
            defrag_min_fraction: s.defrag_min_fraction,
            defrag_force_fraction: s.defrag_force_fraction,
            valid_lookback_days: s.valid_lookback_days,
        }
    }

    /// Apply overrides looked up through `var`; returns the ones ignored
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Vec<ConfigError> {
        let mut ignored = Vec::new();

        // Engine overrides
        if let Some(data_dir) = var("SPDB_DATA_DIR") {
            self.spdb.data_dir = data_dir;
        }
        if let Some(ms) = var("SPDB_LOCK_TIMEOUT_MS") {
            match ms.parse() {
                Ok(ms) => self.spdb.lock_timeout_ms = ms,
                Err(_) => ignored.push(ConfigError::BadOverride {
                    var: "SPDB_LOCK_TIMEOUT_MS".to_string(),
                    value: ms,
                }),
            }
        }
        if let Some(flag) = var("SPDB_ENABLE_DEFRAG") {
            self.spdb.enable_defrag = parse_flag(&flag);
        }
        if let Some(flag) = var("SPDB_ALLOW_NO_LOCK") {
            self.spdb.allow_no_lock = parse_flag(&flag);
        }

        // Logging overrides
        if let Some(level) = var("SPDB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("SPDB_LOG_FORMAT") {
            self.logging.format = format;
        }

        ignored
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Ignoring {var}={value:?}: not a number")]
    BadOverride { var: String, value: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# SPDB Configuration
#
# Environment variables override these settings:
# - SPDB_DATA_DIR
# - SPDB_LOCK_TIMEOUT_MS
# - SPDB_ENABLE_DEFRAG
# - SPDB_ALLOW_NO_LOCK
# - SPDB_LOG_LEVEL
# - SPDB_LOG_FORMAT
#
# SPDB_CONFIG may point at this file directly.

[spdb]
# Database directory used when none is given on the command line
data_dir = "~/.local/share/spdb"

# How long a writer waits for a day's lock (ms)
lock_timeout_ms = 10000

# How long a reader waits before reading without a lock (ms)
read_lock_timeout_ms = 1000

# Pause between lock attempts (ms)
lock_retry_ms = 50

# Skip read locks entirely (read-only media)
allow_no_lock = false

# Compact data files on commit once fragmentation crosses the thresholds
enable_defrag = false
defrag_min_frag_bytes = 10000
defrag_min_fraction = 0.05
defrag_force_fraction = 0.3

# Earlier days searched by valid-time queries
valid_lookback_days = 3

[logging]
# Log level: trace, debug, info, warn, error
level = "warn"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_template_parses_to_defaults() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        let defaults = Config::default();
        assert_eq!(config.spdb.lock_timeout_ms, defaults.spdb.lock_timeout_ms);
        assert_eq!(config.spdb.valid_lookback_days, 3);
        assert_eq!(config.engine_config(), SpdbConfig::default());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spdb.toml");
        std::fs::write(&path, "[spdb]\nenable_defrag = true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.spdb.enable_defrag);
        assert_eq!(config.spdb.lock_retry_ms, 50);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        let missing = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[spdb\n").unwrap();
        assert!(matches!(Config::load(&path).unwrap_err(), ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SPDB_DATA_DIR", "/data/spdb"),
            ("SPDB_LOCK_TIMEOUT_MS", "250"),
            ("SPDB_ENABLE_DEFRAG", "true"),
            ("SPDB_ALLOW_NO_LOCK", "1"),
            ("SPDB_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.spdb.data_dir, "/data/spdb");
        assert!(config.spdb.enable_defrag);
        assert!(config.spdb.allow_no_lock);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "warn");

        let engine = config.engine_config();
        assert_eq!(engine.lock_timeout, Duration::from_millis(250));
        assert!(engine.allow_no_lock);
    }

    #[test]
    fn test_bad_numeric_override_ignored() {
        let mut config = Config::default();
        let ignored =
            config.apply_overrides(|key| (key == "SPDB_LOCK_TIMEOUT_MS").then(|| "soon".to_string()));
        assert_eq!(config.spdb.lock_timeout_ms, 10_000);
        assert!(matches!(
            ignored.as_slice(),
            [ConfigError::BadOverride { var, value }] if var == "SPDB_LOCK_TIMEOUT_MS" && value == "soon"
        ));
    }

    #[test]
    fn test_discovery_keeps_problems_for_later_logging() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        let good = dir.path().join("good.toml");
        std::fs::write(&bad, "[spdb\n").unwrap();
        std::fs::write(&good, "[logging]\nlevel = \"debug\"\n").unwrap();
        let candidates = vec![dir.path().join("absent.toml"), bad.clone(), good.clone()];

        let loaded = Config::discover_in(&candidates, |key| {
            (key == "SPDB_LOCK_TIMEOUT_MS").then(|| "later".to_string())
        });

        assert_eq!(loaded.source.as_deref(), Some(good.as_path()));
        assert_eq!(loaded.config.logging.level, "debug");
        assert_eq!(loaded.problems.len(), 2);
        assert!(matches!(&loaded.problems[0], ConfigError::Parse { path, .. } if *path == bad));
        assert!(matches!(loaded.problems[1], ConfigError::BadOverride { .. }));
    }

    #[test]
    fn test_discovery_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let loaded = Config::discover_in(&[dir.path().join("absent.toml")], |_| None);
        assert!(loaded.source.is_none());
        assert!(loaded.problems.is_empty());
        assert_eq!(loaded.config.logging.level, "warn");
    }
}

use crate::core::{Result, TablekitError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Rules for one field as written in the config: rule kind to parameter.
pub type FieldRuleTable = BTreeMap<String, toml::Value>;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exposes raw driver messages and SQL traces in envelopes
    #[serde(default)]
    pub debug_mode: bool,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Table name to field name to rules
    #[serde(default)]
    pub validation: BTreeMap<String, BTreeMap<String, FieldRuleTable>>,
}

/// Database-related configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Character set applied to new handles; empty keeps the default
    #[serde(default)]
    pub charset: String,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Schema cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    /// Directory for per-table description files
    pub dir: Option<PathBuf>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Configured directory, else the user cache directory, else a local one.
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .map(|d| d.join("tablekit"))
                .unwrap_or_else(|| PathBuf::from(".tablekit-cache")),
        }
    }
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            path: path.into(),
            charset: String::new(),
            max_pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Config {
    /// Default configuration for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Config {
            debug_mode: false,
            database: DatabaseConfig::new(path),
            cache: CacheConfig::default(),
            validation: BTreeMap::new(),
        }
    }

    /// Applies `TABLEKIT_DB_PATH` and `TABLEKIT_DEBUG` from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("TABLEKIT_DB_PATH").filter(|p| !p.is_empty()) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(debug) = lookup("TABLEKIT_DEBUG") {
            self.debug_mode = matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_pool_size == 0 {
            return Err(TablekitError::Config("max_pool_size must be at least 1".to_string()));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(TablekitError::Config("database.path must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// Environment overrides are applied after parsing.
///
/// # Example
///
/// ```no_run
/// let config = tablekit::config::load_config("tablekit.toml").expect("Failed to load config");
/// println!("{:?}", config.database.path);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    let mut config = parse_config(&content)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Parses configuration text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| TablekitError::Config(e.to_string()))
}

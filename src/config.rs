//! Configuration: `requestkeeper.toml` plus environment overrides
//!
//! Precedence, lowest first: built-in defaults, the TOML file, environment
//! variables, then CLI flags (applied by the binary).

use crate::pool::PoolConfig;
use crate::storage::GatewayConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    /// When false the gateway runs cache-only
    pub enabled: bool,
    pub pool_name: String,
    pub pool_size: u32,
    pub reset_session: bool,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub health_check_secs: u64,
    pub timeout_secs: u64,
    pub recycle_secs: u64,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            path: pool.database,
            enabled: true,
            pool_name: pool.pool_name,
            pool_size: pool.pool_size,
            reset_session: pool.reset_session,
            retry_attempts: pool.retry_attempts,
            retry_delay_ms: pool.retry_delay.as_millis() as u64,
            health_check_secs: pool.health_check_interval.as_secs(),
            timeout_secs: pool.connection_timeout.as_secs(),
            recycle_secs: pool.max_lifetime.map(|d| d.as_secs()).unwrap_or(0),
            busy_timeout_ms: pool.busy_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub stats_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stats_ttl_secs: GatewayConfig::default().stats_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
}

impl StoreConfig {
    /// Apply environment overrides read through `lookup`
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db = &mut self.database;
        if let Some(path) = lookup("DB_PATH") {
            db.path = PathBuf::from(path);
        }
        override_with(&lookup, "USE_DATABASE", &mut db.enabled, parse_bool)?;
        if let Some(name) = lookup("DB_POOL_NAME") {
            db.pool_name = name;
        }
        override_with(&lookup, "POOL_SIZE", &mut db.pool_size, parse_number)?;
        override_with(&lookup, "POOL_RESET_SESSION", &mut db.reset_session, parse_bool)?;
        override_with(&lookup, "POOL_RETRY_ATTEMPTS", &mut db.retry_attempts, parse_number)?;
        override_with(&lookup, "POOL_RETRY_DELAY_MS", &mut db.retry_delay_ms, parse_number)?;
        override_with(&lookup, "POOL_HEALTH_CHECK", &mut db.health_check_secs, parse_number)?;
        override_with(&lookup, "DB_POOL_TIMEOUT", &mut db.timeout_secs, parse_number)?;
        override_with(&lookup, "DB_POOL_RECYCLE", &mut db.recycle_secs, parse_number)?;
        override_with(&lookup, "DB_BUSY_TIMEOUT_MS", &mut db.busy_timeout_ms, parse_number)?;
        override_with(&lookup, "CACHE_TTL_STATS", &mut self.cache.stats_ttl_secs, parse_number)?;
        Ok(self)
    }

    /// Apply overrides from the process environment
    pub fn with_process_env(self) -> Result<Self> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let db = &self.database;
        let mut config = PoolConfig::new(&db.path)
            .with_pool_name(&db.pool_name)
            .with_pool_size(db.pool_size)
            .with_retry(db.retry_attempts, Duration::from_millis(db.retry_delay_ms))
            .with_connection_timeout(Duration::from_secs(db.timeout_secs))
            .with_health_check_interval(Duration::from_secs(db.health_check_secs));
        config.reset_session = db.reset_session;
        config.max_lifetime = (db.recycle_secs > 0).then(|| Duration::from_secs(db.recycle_secs));
        config.busy_timeout = Duration::from_millis(db.busy_timeout_ms);
        config
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            stats_ttl: Duration::from_secs(self.cache.stats_ttl_secs),
        }
    }
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
    parse: fn(&str) -> Option<T>,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *target = parse(raw.trim()).ok_or_else(|| Error::Config(format!("invalid value for {}: {:?}", key, raw)))?;
    }
    Ok(())
}

fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("requestkeeper.toml")
}

/// Load the TOML file. A missing default file means defaults; a missing file
/// that was asked for explicitly is an error.
pub fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    let explicit = path.is_some();
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!("config file not found: {}", path.display())));
        }
        return Ok(StoreConfig::default());
    }

    let contents = std::fs::read_to_string(&path)?;
    toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

pub fn ensure_db_dir(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_pool_defaults() {
        let config = StoreConfig::default();
        let pool = config.pool_config();
        assert_eq!(pool.pool_size, 10);
        assert_eq!(pool.retry_attempts, 2);
        assert_eq!(pool.max_lifetime, Some(Duration::from_secs(3600)));
        assert_eq!(config.gateway_config().stats_ttl, Duration::from_secs(180));
        assert!(config.database.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let config = StoreConfig::default()
            .apply_env(env(&[
                ("DB_PATH", "/tmp/other.db"),
                ("USE_DATABASE", "false"),
                ("POOL_SIZE", "5"),
                ("POOL_RESET_SESSION", "0"),
                ("DB_POOL_RECYCLE", "0"),
                ("CACHE_TTL_STATS", "30"),
            ]))
            .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/other.db"));
        assert!(!config.database.enabled);
        let pool = config.pool_config();
        assert_eq!(pool.pool_size, 5);
        assert!(!pool.reset_session);
        assert_eq!(pool.max_lifetime, None);
        assert_eq!(config.gateway_config().stats_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_env_value() {
        let result = StoreConfig::default().apply_env(env(&[("POOL_SIZE", "many")]));
        assert!(matches!(result, Err(Error::Config(message)) if message.contains("POOL_SIZE")));
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("requestkeeper.toml");
        std::fs::write(
            &path,
            "[database]\npath = \"data/bot.db\"\npool_size = 3\n\n[cache]\nstats_ttl_secs = 60\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/bot.db"));
        assert_eq!(config.database.pool_size, 3);
        // Unset keys keep their defaults
        assert_eq!(config.database.retry_attempts, 2);
        assert_eq!(config.cache.stats_ttl_secs, 60);

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_ensure_db_dir() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("nested").join("store.db");
        ensure_db_dir(&db).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}

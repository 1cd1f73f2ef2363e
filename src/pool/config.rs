use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolConfig {
    /// SQLite database file
    pub database: PathBuf,
    pub pool_name: String,
    /// Upper bound on live connections
    pub pool_size: u32,
    /// Flush per-connection statement caches when a connection is released
    pub reset_session: bool,
    /// Extra checkout attempts after the first one fails
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// How long one checkout waits for a free, valid connection
    pub connection_timeout: Duration,
    /// Connections older than this are retired by the pool
    pub max_lifetime: Option<Duration>,
    pub busy_timeout: Duration,
    pub health_check_interval: Duration,
}

impl PoolConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_name(mut self, name: &str) -> Self {
        self.pool_name = name.to_string();
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        // r2d2 rejects a zero timeout
        self.connection_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("requestkeeper.db"),
            pool_name: "requestkeeper_pool".to_string(),
            pool_size: 10,
            reset_session: true,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(250),
            connection_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(3600)),
            busy_timeout: Duration::from_millis(5000),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

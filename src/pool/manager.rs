//! ConnectionPoolManager implementation

use super::config::PoolConfig;
use super::connection::{lock, PooledConnection, StoreConnectionManager};
use super::error::PoolError;
use super::stats::{PerformanceStats, PoolStatistics};
use crate::record::{row_to_record, Record};
use r2d2::Pool;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Floor for a checkout that has to open a new connection
const MIN_CONNECT_WAIT: Duration = Duration::from_millis(500);

/// One statement of a transaction: SQL text and its positional parameters
pub type Statement = (String, Vec<SqlValue>);

/// What `execute_query` should hand back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// First row, if any
    One,
    /// Every row
    All,
    /// Number of rows changed
    Affected,
}

/// Result of `execute_query`, shaped by the requested `FetchMode`
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Row(Option<Record>),
    Rows(Vec<Record>),
    Affected(usize),
}

impl QueryOutput {
    pub fn into_row(self) -> Option<Record> {
        match self {
            QueryOutput::Row(row) => row,
            QueryOutput::Rows(rows) => rows.into_iter().next(),
            QueryOutput::Affected(_) => None,
        }
    }

    pub fn into_rows(self) -> Vec<Record> {
        match self {
            QueryOutput::Row(row) => row.into_iter().collect(),
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Affected(_) => Vec::new(),
        }
    }

    pub fn affected(&self) -> usize {
        match self {
            QueryOutput::Affected(n) => *n,
            QueryOutput::Row(row) => usize::from(row.is_some()),
            QueryOutput::Rows(rows) => rows.len(),
        }
    }
}

/// Read-only snapshot of a pool's configuration and counters
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_exists: bool,
    pub pool_name: String,
    pub pool_size: u32,
    pub status: String,
    pub connections: u32,
    pub idle_connections: u32,
    pub last_health_check: Option<bool>,
    pub stats: PoolStatistics,
}

/// Owns a bounded set of reusable connections to the relational store.
///
/// The manager starts unset; `create_pool` (or the first `acquire`) builds the
/// underlying r2d2 pool. It is `Send + Sync` and meant to be shared through an
/// `Arc` by the migration engine and the storage gateway.
pub struct ConnectionPoolManager {
    config: PoolConfig,
    pool: Mutex<Option<Pool<StoreConnectionManager>>>,
    closed: AtomicBool,
    stats: Arc<Mutex<PoolStatistics>>,
    last_health: Mutex<Option<(Instant, bool)>>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        info!("Connection pool initialized: {}", config.pool_name);
        Self {
            config,
            pool: Mutex::new(None),
            closed: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(PoolStatistics::default())),
            last_health: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether the underlying pool currently exists
    pub fn is_created(&self) -> bool {
        lock(&self.pool).is_some()
    }

    // ========== Lifecycle ==========

    /// Build the pool and confirm the store is reachable.
    ///
    /// Calling this while a pool exists is a no-op. On failure the pool stays
    /// unset and the error is returned to the caller.
    pub fn create_pool(&self) -> Result<(), PoolError> {
        if self.is_created() {
            debug!("Pool already exists: {}", self.config.pool_name);
            return Ok(());
        }

        info!(
            pool = %self.config.pool_name,
            size = self.config.pool_size,
            database = %self.config.database.display(),
            "Creating connection pool"
        );

        let manager = StoreConnectionManager::new(
            &self.config.database,
            self.config.busy_timeout,
            Arc::clone(&self.stats),
        );
        // Connect without holding the slot lock so callers never queue behind
        // an unreachable store
        if let Err(e) = manager.check_reachable() {
            error!("Failed to create connection pool {}: {}", self.config.pool_name, e);
            return Err(PoolError::Connection {
                pool: self.config.pool_name.clone(),
                reason: e.to_string(),
            });
        }

        let pool = Pool::builder()
            .max_size(self.config.pool_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(self.config.connection_timeout)
            .max_lifetime(self.config.max_lifetime)
            .test_on_check_out(true)
            .build_unchecked(manager);

        let mut slot = lock(&self.pool);
        if slot.is_none() {
            *slot = Some(pool);
        }
        self.closed.store(false, Ordering::Release);
        info!("Connection pool created successfully: {}", self.config.pool_name);
        Ok(())
    }

    /// Tear the pool down. Later acquisitions fail until `create_pool` is
    /// called again; connections still leased close when their guards drop.
    pub fn close(&self) {
        let mut slot = lock(&self.pool);
        if slot.take().is_some() {
            info!("Closing connection pool: {}", self.config.pool_name);
        }
        self.closed.store(true, Ordering::Release);
    }

    fn current_pool(&self) -> Result<Pool<StoreConnectionManager>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed(self.config.pool_name.clone()));
        }
        if let Some(pool) = lock(&self.pool).as_ref() {
            return Ok(pool.clone());
        }
        self.create_pool()?;
        lock(&self.pool).clone().ok_or_else(|| PoolError::Connection {
            pool: self.config.pool_name.clone(),
            reason: "pool was not created".to_string(),
        })
    }

    // ========== Acquisition ==========

    /// Lease a validated connection.
    ///
    /// Every checkout runs a liveness query; a connection that fails it is
    /// discarded and replaced. If no valid connection can be produced, the
    /// checkout is retried `retry_attempts` times with `retry_delay` between
    /// attempts before giving up.
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let pool = self.current_pool()?;
        let attempts = self.config.retry_attempts + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match pool.get_timeout(self.checkout_timeout(&pool)) {
                Ok(conn) => {
                    lock(&self.stats).pool_hits += 1;
                    return Ok(PooledConnection::new(
                        conn,
                        Arc::clone(&self.stats),
                        self.config.reset_session,
                    ));
                }
                Err(e) => {
                    lock(&self.stats).pool_misses += 1;
                    warn!(attempt, attempts, "Connection checkout failed: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }

        error!("No connection available from pool {}", self.config.pool_name);
        Err(PoolError::Unavailable {
            pool: self.config.pool_name.clone(),
            attempts,
            reason: last_error,
        })
    }

    /// A saturated pool waits up to `connection_timeout` for a release. When a
    /// slot is free the checkout has to open a connection, and a store that
    /// cannot be reached should fail within `retry_delay` so the retries stay
    /// short.
    fn checkout_timeout(&self, pool: &Pool<StoreConnectionManager>) -> Duration {
        let state = pool.state();
        if state.idle_connections == 0 && state.connections >= pool.max_size() {
            self.config.connection_timeout
        } else {
            self.config.retry_delay.max(MIN_CONNECT_WAIT)
        }
    }

    // ========== Execution ==========

    /// Run one statement on a pooled connection.
    ///
    /// Statements run outside any explicit transaction, so SQLite commits
    /// each one on completion. Counted in `total_queries` / `failed_queries`.
    pub fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        fetch: FetchMode,
    ) -> Result<QueryOutput, PoolError> {
        let result = self
            .acquire()
            .and_then(|conn| run_statement(&conn, sql, params, fetch).map_err(PoolError::from));

        self.record_queries(1, result.is_err());
        if let Err(e) = &result {
            error!("Query execution failed: {}", e);
            debug!("Query: {}", sql.trim());
            debug!("Params: {:?}", params);
        }
        result
    }

    /// Run the same statement once per parameter set inside one transaction.
    /// Returns the total number of rows changed.
    pub fn execute_many(&self, sql: &str, params_list: &[Vec<SqlValue>]) -> Result<usize, PoolError> {
        let result = self.run_many(sql, params_list);
        self.record_queries(params_list.len() as u64, result.is_err());
        if let Err(e) = &result {
            error!("Batch execution failed: {}", e);
        }
        result
    }

    fn run_many(&self, sql: &str, params_list: &[Vec<SqlValue>]) -> Result<usize, PoolError> {
        let mut conn = self.acquire()?;
        let tx = conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare(sql)?;
            for params in params_list {
                affected += stmt.execute(params_from_iter(params.iter()))?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    /// Execute statements in order inside one transaction.
    ///
    /// Commits only if every statement succeeds. On the first failure the
    /// transaction is rolled back and `PoolError::Transaction` is returned,
    /// so callers never observe partial application. On success, returns the
    /// rows changed by each statement.
    pub fn execute_transaction(&self, statements: &[Statement]) -> Result<Vec<usize>, PoolError> {
        let total = statements.len() as u64;
        let mut conn = match self.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                self.record_queries(total, true);
                error!("Transaction failed: {}", e);
                return Err(e);
            }
        };

        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(source) => {
                self.record_queries(total, true);
                error!("Transaction failed to start: {}", source);
                return Err(PoolError::Transaction { index: 0, source });
            }
        };

        let mut counts = Vec::with_capacity(statements.len());
        for (index, (sql, params)) in statements.iter().enumerate() {
            match tx.execute(sql, params_from_iter(params.iter())) {
                Ok(n) => counts.push(n),
                Err(source) => {
                    if let Err(e) = tx.rollback() {
                        error!("Rollback failed: {}", e);
                    }
                    self.record_queries(total, true);
                    error!(index, "Transaction failed: {}", source);
                    return Err(PoolError::Transaction { index, source });
                }
            }
        }

        if let Err(source) = tx.commit() {
            self.record_queries(total, true);
            error!("Transaction commit failed: {}", source);
            return Err(PoolError::Transaction {
                index: statements.len(),
                source,
            });
        }

        self.record_queries(total, false);
        Ok(counts)
    }

    fn record_queries(&self, count: u64, failed: bool) {
        let mut stats = lock(&self.stats);
        stats.total_queries += count;
        if failed {
            stats.failed_queries += count;
        }
    }

    // ========== Health & Reporting ==========

    /// Acquire a connection and run a trivial query
    pub fn health_check(&self) -> bool {
        let healthy = match self.acquire() {
            Ok(conn) => match conn.query_row("SELECT 1 AS health_check", [], |row| row.get::<_, i64>(0)) {
                Ok(value) => value == 1,
                Err(e) => {
                    warn!("Health check failed: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        };
        *lock(&self.last_health) = Some((Instant::now(), healthy));
        healthy
    }

    /// Whether `health_check_interval` has passed since the last successful
    /// check. A failed last check is always due again.
    pub fn health_check_due(&self) -> bool {
        match *lock(&self.last_health) {
            Some((at, true)) => at.elapsed() >= self.config.health_check_interval,
            _ => true,
        }
    }

    /// Outcome of the most recent health check, if one ran
    pub fn last_health(&self) -> Option<bool> {
        lock(&self.last_health).map(|(_, healthy)| healthy)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> PoolStatistics {
        lock(&self.stats).clone()
    }

    pub fn pool_status(&self) -> PoolStatus {
        let state = lock(&self.pool).as_ref().map(|pool| pool.state());
        let status = match (&state, self.closed.load(Ordering::Acquire)) {
            (Some(_), _) => "active",
            (None, true) => "closed",
            (None, false) => "not_created",
        };
        PoolStatus {
            pool_exists: state.is_some(),
            pool_name: self.config.pool_name.clone(),
            pool_size: self.config.pool_size,
            status: status.to_string(),
            connections: state.as_ref().map(|s| s.connections).unwrap_or(0),
            idle_connections: state.as_ref().map(|s| s.idle_connections).unwrap_or(0),
            last_health_check: self.last_health(),
            stats: self.stats(),
        }
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        let stats = self.stats();
        PerformanceStats {
            success_rate: stats.success_rate(),
            pool_hit_rate: stats.pool_hit_rate(),
            stats,
            pool_name: self.config.pool_name.clone(),
            pool_size: self.config.pool_size,
            reset_session: self.config.reset_session,
        }
    }

    pub fn reset_stats(&self) {
        let mut stats = lock(&self.stats);
        let active = stats.active_connections;
        *stats = PoolStatistics {
            // Leases outstanding right now are still outstanding
            active_connections: active,
            ..PoolStatistics::default()
        };
        info!("Pool statistics reset");
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    fetch: FetchMode,
) -> rusqlite::Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let output = match fetch {
        FetchMode::One => {
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let row = match rows.next()? {
                Some(row) => Some(row_to_record(row, &columns)?),
                None => None,
            };
            QueryOutput::Row(row)
        }
        FetchMode::All => {
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row, &columns)?);
            }
            QueryOutput::Rows(records)
        }
        FetchMode::Affected if columns.is_empty() => {
            QueryOutput::Affected(stmt.execute(params_from_iter(params.iter()))?)
        }
        FetchMode::Affected => {
            // Statements that yield rows (RETURNING, some PRAGMAs) are stepped to completion
            {
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                while rows.next()?.is_some() {}
            }
            QueryOutput::Affected(conn.changes() as usize)
        }
    };
    Ok(output)
}

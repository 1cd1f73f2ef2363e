//! Connection manager and the scoped connection guard

use super::stats::PoolStatistics;
use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// r2d2 manager for SQLite connections.
///
/// Counts created and failed connections, and validates every checkout with a
/// trivial round trip so a dead connection is replaced instead of handed out.
pub(crate) struct StoreConnectionManager {
    inner: SqliteConnectionManager,
    stats: Arc<Mutex<PoolStatistics>>,
}

impl StoreConnectionManager {
    pub(crate) fn new(path: &Path, busy_timeout: Duration, stats: Arc<Mutex<PoolStatistics>>) -> Self {
        let inner = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "foreign_keys", true)?;
            Ok(())
        });
        Self { inner, stats }
    }

    /// Open and check one connection outside any pool, failing immediately
    /// instead of waiting out a checkout timeout. Only failures are counted.
    pub(crate) fn check_reachable(&self) -> Result<(), rusqlite::Error> {
        let result = self
            .inner
            .connect()
            .and_then(|mut conn| self.is_valid(&mut conn));
        if result.is_err() {
            lock(&self.stats).failed_connections += 1;
        }
        result
    }
}

impl ManageConnection for StoreConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        match self.inner.connect() {
            Ok(conn) => {
                lock(&self.stats).created_connections += 1;
                Ok(conn)
            }
            Err(e) => {
                lock(&self.stats).failed_connections += 1;
                Err(e)
            }
        }
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// A leased connection.
///
/// Dropping the guard returns the connection to the pool on every exit path.
/// A transaction still open at that point is rolled back first.
pub struct PooledConnection {
    conn: r2d2::PooledConnection<StoreConnectionManager>,
    stats: Arc<Mutex<PoolStatistics>>,
    reset_session: bool,
}

impl PooledConnection {
    pub(crate) fn new(
        conn: r2d2::PooledConnection<StoreConnectionManager>,
        stats: Arc<Mutex<PoolStatistics>>,
        reset_session: bool,
    ) -> Self {
        lock(&stats).active_connections += 1;
        Self {
            conn,
            stats,
            reset_session,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            tracing::warn!("Connection released inside a transaction, rolling back");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!("Rollback on release failed: {}", e);
            }
        }
        if self.reset_session {
            self.conn.flush_prepared_statement_cache();
        }
        let mut stats = lock(&self.stats);
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }
}

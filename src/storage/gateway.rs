//! StorageGateway implementation

use super::cache::EntityCache;
use super::filter::QueryFilter;
use super::stats::{DatabaseInfo, GatewayMetrics, StatsSource, SystemStats, UserStatistics};
use crate::entity::EntityKind;
use crate::pool::{ConnectionPoolManager, FetchMode, PoolError, QueryOutput, Statement};
use crate::record::{get_i64, get_str, timestamp_hours_ago, to_sql_value, Record};
use crate::Result;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Whether persistent operations are currently reaching the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    DatabaseActive,
    CacheOnly,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::DatabaseActive => write!(f, "database_active"),
            StorageMode::CacheOnly => write!(f, "cache_only"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long `system_stats` reuses a computed view
    pub stats_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            stats_ttl: Duration::from_secs(180),
        }
    }
}

const PRIORITY_ORDER: &str = "CASE priority \
    WHEN 'vip' THEN 5 WHEN 'urgent' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END";

fn priority_rank(record: &Record) -> i64 {
    match get_str(record, "priority") {
        Some("vip") => 5,
        Some("urgent") => 4,
        Some("high") => 3,
        Some("medium") => 2,
        _ => 1,
    }
}

fn sql_limit(limit: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

/// Entity persistence with an in-process cache in front of the store.
///
/// Writes go to the store first and are mirrored into the cache. When the
/// store fails, the gateway switches to cache-only mode and keeps serving:
/// the write lands in the cache alone and `degraded_writes` is incremented.
/// Persistence faults never reach the caller; only invalid input does.
pub struct StorageGateway {
    pool: Option<Arc<ConnectionPoolManager>>,
    config: GatewayConfig,
    cache: EntityCache,
    mode: Mutex<StorageMode>,
    stats_view: Mutex<Option<(Instant, SystemStats)>>,
    degraded_writes: AtomicU64,
    fallback_reads: AtomicU64,
}

impl StorageGateway {
    /// Build a gateway over `pool`. Without a pool, or if the pool cannot be
    /// created, the gateway starts in cache-only mode.
    pub fn new(pool: Option<Arc<ConnectionPoolManager>>, config: GatewayConfig) -> Self {
        let mode = match &pool {
            Some(pool) => match pool.create_pool() {
                Ok(()) => {
                    info!("Storage gateway using database");
                    StorageMode::DatabaseActive
                }
                Err(e) => {
                    warn!("Database unavailable, starting in cache-only mode: {}", e);
                    StorageMode::CacheOnly
                }
            },
            None => {
                info!("No database configured, using cache only");
                StorageMode::CacheOnly
            }
        };

        Self {
            pool,
            config,
            cache: EntityCache::new(),
            mode: Mutex::new(mode),
            stats_view: Mutex::new(None),
            degraded_writes: AtomicU64::new(0),
            fallback_reads: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> StorageMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: StorageMode) {
        let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != mode {
            match mode {
                StorageMode::DatabaseActive => info!("Database reachable again, leaving cache-only mode"),
                StorageMode::CacheOnly => warn!("Switching to cache-only mode"),
            }
            *current = mode;
        }
    }

    /// Run `op` against the store. `None` means the caller must fall back to
    /// the cache; the failure is logged and the mode updated.
    fn with_store<T>(
        &self,
        action: &str,
        op: impl FnOnce(&ConnectionPoolManager) -> std::result::Result<T, PoolError>,
    ) -> Option<T> {
        let pool = self.pool.as_deref()?;
        match op(pool) {
            Ok(value) => {
                self.set_mode(StorageMode::DatabaseActive);
                Some(value)
            }
            Err(e) => {
                warn!(action, "Database operation failed, falling back to cache: {}", e);
                self.set_mode(StorageMode::CacheOnly);
                None
            }
        }
    }

    fn fetch_row(&self, kind: EntityKind, id: i64) -> Option<Option<Record>> {
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", kind.table(), kind.key_column());
        self.with_store("get", |pool| {
            pool.execute_query(&sql, &[SqlValue::Integer(id)], FetchMode::One)
                .map(QueryOutput::into_row)
        })
    }

    fn invalidate_stats(&self) {
        self.stats_view.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    // ========== Write path ==========

    /// Persist a new entity and return its id.
    ///
    /// Users are keyed by `user_id` and ratings by `(request_id, user_id)`;
    /// saving either again updates the supplied fields. Fails only when the
    /// record itself is invalid.
    pub fn save(&self, kind: EntityKind, record: &Record) -> Result<i64> {
        let prepared = kind.prepare_insert(record)?;
        let update_columns = upsert_columns(kind, record, &prepared);

        let (sql, params) = insert_statement(kind, &prepared, &update_columns);
        let stored = self.with_store("save", |pool| {
            pool.execute_query(&sql, &params, FetchMode::One).map(QueryOutput::into_row)
        });

        let id = match stored {
            Some(Some(row)) => {
                let id = get_i64(&row, kind.key_column());
                self.cache.put(kind, id, row);
                debug!("Saved {} {}", kind, id);
                id
            }
            _ => {
                self.degraded_writes.fetch_add(1, Ordering::Relaxed);
                let id = self.cache.save_local(kind, prepared, &update_columns);
                warn!("Saved {} {} to cache only", kind, id);
                id
            }
        };

        self.invalidate_stats();
        Ok(id)
    }

    /// Update allow-listed fields of one entity. Returns whether it was found
    /// and changed; fields outside the allow-list are ignored.
    pub fn update(&self, kind: EntityKind, id: i64, fields: &Record) -> bool {
        let Some(prepared) = kind.prepare_update(fields) else {
            warn!("No updatable fields supplied for {} {}", kind, id);
            return false;
        };

        let (sql, params) = update_statement(kind, id, &prepared);
        let affected = self.with_store("update", |pool| {
            pool.execute_query(&sql, &params, FetchMode::Affected)
                .map(|output| output.affected())
        });

        let updated = match affected {
            Some(0) => false,
            Some(_) => {
                if !self.cache.merge(kind, id, &prepared) {
                    if let Some(Some(row)) = self.fetch_row(kind, id) {
                        self.cache.put(kind, id, row);
                    }
                }
                true
            }
            None => {
                self.degraded_writes.fetch_add(1, Ordering::Relaxed);
                self.cache.merge(kind, id, &prepared)
            }
        };

        if updated {
            self.invalidate_stats();
        }
        updated
    }

    /// Apply several updates in one transaction. Returns how many entities
    /// changed. If the store rejects the batch, nothing of it is persisted and
    /// the updates are applied to cached entries instead.
    pub fn batch_update(&self, kind: EntityKind, updates: &[(i64, Record)]) -> usize {
        let prepared: Vec<(i64, Record)> = updates
            .iter()
            .filter_map(|(id, fields)| kind.prepare_update(fields).map(|p| (*id, p)))
            .collect();
        if prepared.is_empty() {
            return 0;
        }

        let statements: Vec<Statement> = prepared
            .iter()
            .map(|(id, fields)| update_statement(kind, *id, fields))
            .collect();

        let changed = match self.with_store("batch_update", |pool| pool.execute_transaction(&statements)) {
            Some(counts) => {
                let mut changed = 0;
                for ((id, fields), count) in prepared.iter().zip(counts) {
                    if count > 0 {
                        self.cache.merge(kind, *id, fields);
                        changed += 1;
                    }
                }
                changed
            }
            None => {
                self.degraded_writes
                    .fetch_add(prepared.len() as u64, Ordering::Relaxed);
                prepared
                    .iter()
                    .filter(|(id, fields)| self.cache.merge(kind, *id, fields))
                    .count()
            }
        };

        if changed > 0 {
            self.invalidate_stats();
        }
        changed
    }

    /// Rate a request (1 to 5). A user rating the same request again replaces
    /// the earlier rating.
    pub fn save_rating(&self, request_id: i64, user_id: i64, rating: i64, comment: Option<&str>) -> Result<i64> {
        let mut record = Record::new();
        record.insert("request_id".to_string(), Value::from(request_id));
        record.insert("user_id".to_string(), Value::from(user_id));
        record.insert("rating".to_string(), Value::from(rating));
        if let Some(comment) = comment {
            record.insert("comment".to_string(), Value::from(comment));
        }
        self.save(EntityKind::Rating, &record)
    }

    // ========== Read path ==========

    /// Cached record if present, otherwise the store's row (then cached)
    pub fn get(&self, kind: EntityKind, id: i64) -> Option<Record> {
        if let Some(record) = self.cache.get(kind, id) {
            return Some(record);
        }
        match self.fetch_row(kind, id) {
            Some(Some(row)) => {
                self.cache.put(kind, id, row.clone());
                Some(row)
            }
            Some(None) => None,
            None => {
                self.fallback_reads.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Records matching `filter`, newest first, at most `limit`.
    ///
    /// Served by the store when reachable; otherwise by scanning the cache,
    /// which only knows what this process has seen.
    pub fn query(&self, kind: EntityKind, filter: &QueryFilter, limit: usize) -> Result<Vec<Record>> {
        let (clause, mut params) = filter.to_sql(kind)?;
        params.push(sql_limit(limit));
        let sql = format!(
            "SELECT * FROM {} {} ORDER BY {} DESC, {} DESC LIMIT ?{}",
            kind.table(),
            clause,
            kind.created_column(),
            kind.key_column(),
            params.len()
        );

        match self.with_store("query", |pool| {
            pool.execute_query(&sql, &params, FetchMode::All).map(QueryOutput::into_rows)
        }) {
            Some(rows) => {
                self.cache_rows(kind, &rows);
                Ok(rows)
            }
            None => {
                self.fallback_reads.fetch_add(1, Ordering::Relaxed);
                let mut rows = self.cache.scan(kind, |record| filter.matches(kind, record));
                rows.sort_by(|a, b| {
                    let created = kind.created_column();
                    let key = kind.key_column();
                    (get_str(b, created), get_i64(b, key)).cmp(&(get_str(a, created), get_i64(a, key)))
                });
                rows.truncate(limit);
                Ok(rows)
            }
        }
    }

    fn cache_rows(&self, kind: EntityKind, rows: &[Record]) {
        for row in rows {
            self.cache.put(kind, get_i64(row, kind.key_column()), row.clone());
        }
    }

    /// Pending requests, highest priority first, then oldest first
    pub fn pending_requests(&self, category: Option<&str>, limit: usize) -> Vec<Record> {
        let mut params = Vec::new();
        let mut clause = String::from("WHERE status = 'pending'");
        if let Some(category) = category {
            params.push(SqlValue::Text(category.to_string()));
            clause.push_str(" AND category = ?1");
        }
        params.push(sql_limit(limit));
        let sql = format!(
            "SELECT * FROM content_requests {} ORDER BY {} DESC, created_at ASC, id ASC LIMIT ?{}",
            clause,
            PRIORITY_ORDER,
            params.len()
        );

        match self.with_store("pending_requests", |pool| {
            pool.execute_query(&sql, &params, FetchMode::All).map(QueryOutput::into_rows)
        }) {
            Some(rows) => {
                self.cache_rows(EntityKind::Request, &rows);
                rows
            }
            None => {
                self.fallback_reads.fetch_add(1, Ordering::Relaxed);
                let mut rows = self.cache.scan(EntityKind::Request, |record| {
                    get_str(record, "status") == Some("pending")
                        && category.is_none_or(|c| get_str(record, "category") == Some(c))
                });
                rows.sort_by_key(|r| {
                    (
                        Reverse(priority_rank(r)),
                        get_str(r, "created_at").map(String::from),
                        get_i64(r, "id"),
                    )
                });
                rows.truncate(limit);
                rows
            }
        }
    }

    pub fn user_requests(&self, user_id: i64, limit: usize) -> Vec<Record> {
        let filter = QueryFilter::new().eq("user_id", user_id);
        self.query(EntityKind::Request, &filter, limit).unwrap_or_default()
    }

    pub fn request_ratings(&self, request_id: i64) -> Vec<Record> {
        let filter = QueryFilter::new().eq("request_id", request_id);
        self.query(EntityKind::Rating, &filter, usize::MAX).unwrap_or_default()
    }

    // ========== Aggregates ==========

    /// System-wide counters. Computed by the store when reachable and reused
    /// for `stats_ttl`; any write through the gateway invalidates the view.
    pub fn system_stats(&self) -> SystemStats {
        if let Some((at, stats)) = self.stats_view.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if at.elapsed() < self.config.stats_ttl {
                return stats.clone();
            }
        }

        let day_ago = timestamp_hours_ago(24);
        let week_ago = timestamp_hours_ago(24 * 7);

        let from_store = self.with_store("system_stats", |pool| {
            let requests = pool
                .execute_query(
                    "SELECT COUNT(*) AS total_requests, \
                        COALESCE(SUM(status = 'pending'), 0) AS pending_requests, \
                        COALESCE(SUM(status = 'fulfilled'), 0) AS fulfilled_requests, \
                        COALESCE(SUM(status = 'rejected'), 0) AS rejected_requests, \
                        COALESCE(SUM(created_at >= ?1), 0) AS requests_last_24h \
                     FROM content_requests",
                    &[SqlValue::Text(day_ago.clone())],
                    FetchMode::One,
                )?
                .into_row()
                .unwrap_or_default();
            let users = pool
                .execute_query(
                    "SELECT COUNT(*) AS total_users, \
                        COALESCE(SUM(last_seen >= ?1), 0) AS active_users_7d, \
                        COALESCE(SUM(is_banned != 0), 0) AS banned_users \
                     FROM users",
                    &[SqlValue::Text(week_ago.clone())],
                    FetchMode::One,
                )?
                .into_row()
                .unwrap_or_default();
            let ratings = pool
                .execute_query(
                    "SELECT COUNT(*) AS total_ratings, AVG(rating) AS average_rating FROM content_ratings",
                    &[],
                    FetchMode::One,
                )?
                .into_row()
                .unwrap_or_default();
            Ok(SystemStats::from_rows(&requests, &users, &ratings, StatsSource::Database))
        });

        match from_store {
            Some(stats) => {
                *self.stats_view.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((Instant::now(), stats.clone()));
                stats
            }
            None => {
                self.fallback_reads.fetch_add(1, Ordering::Relaxed);
                SystemStats::from_cache(
                    &self.cache.scan(EntityKind::Request, |_| true),
                    &self.cache.scan(EntityKind::User, |_| true),
                    &self.cache.scan(EntityKind::Rating, |_| true),
                    &day_ago,
                    &week_ago,
                )
            }
        }
    }

    pub fn user_statistics(&self, user_id: i64) -> UserStatistics {
        let month_ago = timestamp_hours_ago(24 * 30);

        let from_store = self.with_store("user_statistics", |pool| {
            let requests = pool
                .execute_query(
                    "SELECT COUNT(*) AS total_requests, \
                        COALESCE(SUM(status = 'pending'), 0) AS pending_requests, \
                        COALESCE(SUM(status = 'fulfilled'), 0) AS fulfilled_requests, \
                        COALESCE(SUM(status = 'rejected'), 0) AS rejected_requests, \
                        COALESCE(SUM(created_at >= ?2), 0) AS requests_last_30d, \
                        MIN(created_at) AS first_request_at, \
                        MAX(created_at) AS last_request_at \
                     FROM content_requests WHERE user_id = ?1",
                    &[SqlValue::Integer(user_id), SqlValue::Text(month_ago.clone())],
                    FetchMode::One,
                )?
                .into_row()
                .unwrap_or_default();
            let ratings = pool
                .execute_query(
                    "SELECT COUNT(*) AS ratings_given, AVG(rating) AS average_rating_given \
                     FROM content_ratings WHERE user_id = ?1",
                    &[SqlValue::Integer(user_id)],
                    FetchMode::One,
                )?
                .into_row()
                .unwrap_or_default();
            Ok(UserStatistics::from_rows(user_id, &requests, &ratings, StatsSource::Database))
        });

        from_store.unwrap_or_else(|| {
            self.fallback_reads.fetch_add(1, Ordering::Relaxed);
            let owned_by = |record: &Record| get_i64(record, "user_id") == user_id;
            UserStatistics::from_cache(
                user_id,
                &self.cache.scan(EntityKind::Request, owned_by),
                &self.cache.scan(EntityKind::Rating, owned_by),
                &month_ago,
            )
        })
    }

    // ========== Cache administration ==========

    /// Drop all cached entities and the memoized statistics
    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.clear();
        self.invalidate_stats();
        info!("Cleared {} cached entities", cleared);
        cleared
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Prefetch up to 100 pending requests into the cache. Returns how many
    /// rows the store supplied.
    pub fn sync_cache(&self) -> usize {
        let sql = format!(
            "SELECT * FROM content_requests WHERE status = 'pending' \
             ORDER BY {} DESC, created_at ASC LIMIT 100",
            PRIORITY_ORDER
        );
        let rows = self
            .with_store("sync_cache", |pool| {
                pool.execute_query(&sql, &[], FetchMode::All).map(QueryOutput::into_rows)
            })
            .unwrap_or_default();
        self.cache_rows(EntityKind::Request, &rows);
        info!("Synced {} pending requests into cache", rows.len());
        rows.len()
    }

    /// Whether the store answered its most recent health check. Runs a new
    /// check only once the pool's interval has elapsed.
    pub fn is_database_connected(&self) -> bool {
        let Some(pool) = self.pool.as_deref() else {
            return false;
        };
        if pool.health_check_due() {
            let healthy = pool.health_check();
            self.set_mode(if healthy {
                StorageMode::DatabaseActive
            } else {
                StorageMode::CacheOnly
            });
            return healthy;
        }
        pool.last_health().unwrap_or(false)
    }

    pub fn database_info(&self) -> DatabaseInfo {
        DatabaseInfo {
            connected: self.is_database_connected(),
            mode: self.mode(),
            cache_size: self.cache.len(),
            pool: self.pool.as_deref().map(ConnectionPoolManager::pool_status),
        }
    }

    pub fn metrics(&self) -> GatewayMetrics {
        GatewayMetrics {
            mode: self.mode(),
            cache_size: self.cache.len(),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            fallback_reads: self.fallback_reads.load(Ordering::Relaxed),
            pool: self.pool.as_deref().map(ConnectionPoolManager::performance_stats),
        }
    }
}

/// Columns an upsert may overwrite: those the caller supplied plus
/// `updated_at`, never the natural key or creation time.
fn upsert_columns(kind: EntityKind, supplied: &Record, prepared: &Record) -> Vec<String> {
    let Some(target) = kind.conflict_target() else {
        return Vec::new();
    };
    prepared
        .keys()
        .filter(|column| supplied.contains_key(*column) || column.as_str() == "updated_at")
        .filter(|column| {
            let column = column.as_str();
            !target.contains(&column)
                && column != kind.key_column()
                && column != kind.created_column()
                && column != "created_at"
        })
        .cloned()
        .collect()
}

fn insert_statement(kind: EntityKind, prepared: &Record, update_columns: &[String]) -> (String, Vec<SqlValue>) {
    let columns: Vec<&str> = prepared.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        kind.table(),
        columns.join(", "),
        placeholders.join(", ")
    );

    if let Some(target) = kind.conflict_target() {
        let assignments: Vec<String> = if update_columns.is_empty() {
            // DO NOTHING would suppress RETURNING
            vec![format!("{0} = excluded.{0}", target[0])]
        } else {
            update_columns
                .iter()
                .map(|column| format!("{0} = excluded.{0}", column))
                .collect()
        };
        sql.push_str(&format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            target.join(", "),
            assignments.join(", ")
        ));
    }
    sql.push_str(" RETURNING *");

    let params = prepared.values().map(to_sql_value).collect();
    (sql, params)
}

fn update_statement(kind: EntityKind, id: i64, fields: &Record) -> Statement {
    let assignments: Vec<String> = fields
        .keys()
        .enumerate()
        .map(|(i, column)| format!("{} = ?{}", column, i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        kind.table(),
        assignments.join(", "),
        kind.key_column(),
        fields.len() + 1
    );
    let mut params: Vec<SqlValue> = fields.values().map(to_sql_value).collect();
    params.push(SqlValue::Integer(id));
    (sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{default_units, MigrationEngine};
    use crate::pool::PoolConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn migrated_pool(dir: &TempDir, size: u32) -> Arc<ConnectionPoolManager> {
        let pool = Arc::new(ConnectionPoolManager::new(
            PoolConfig::new(dir.path().join("gateway.db"))
                .with_pool_size(size)
                .with_connection_timeout(Duration::from_secs(10)),
        ));
        let engine = MigrationEngine::new(Arc::clone(&pool), default_units()).unwrap();
        assert!(engine.run(None).unwrap().is_success());
        pool
    }

    fn test_gateway(dir: &TempDir) -> StorageGateway {
        StorageGateway::new(Some(migrated_pool(dir, 4)), GatewayConfig::default())
    }

    fn unreachable_gateway(dir: &TempDir) -> StorageGateway {
        let pool = Arc::new(ConnectionPoolManager::new(
            PoolConfig::new(dir.path().join("missing").join("gateway.db"))
                .with_retry(0, Duration::from_millis(1))
                .with_connection_timeout(Duration::from_millis(100)),
        ));
        StorageGateway::new(Some(pool), GatewayConfig::default())
    }

    fn request(user_id: i64, title: &str) -> Record {
        record(json!({"user_id": user_id, "title": title, "username": "dana"}))
    }

    #[test]
    fn test_read_your_write() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);

        let id = gateway.save(EntityKind::Request, &request(7, "Dune")).unwrap();
        let saved = gateway.get(EntityKind::Request, id).unwrap();

        assert_eq!(saved["title"], json!("Dune"));
        assert_eq!(saved["status"], json!("pending"));
        assert_eq!(saved["id"], json!(id));
        assert_eq!(gateway.mode(), StorageMode::DatabaseActive);
    }

    #[test]
    fn test_cache_mirrors_stored_row() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);

        let id = gateway.save(EntityKind::Request, &request(7, "Dune")).unwrap();
        let cached = gateway.get(EntityKind::Request, id).unwrap();

        gateway.clear_cache();
        let stored = gateway.get(EntityKind::Request, id).unwrap();
        assert_eq!(cached, stored);
        // Store defaults are mirrored too
        assert_eq!(stored["language_pref"], json!("hebrew"));
        assert!(stored.contains_key("season"));
    }

    #[test]
    fn test_unreachable_store_degrades_to_cache() {
        let dir = TempDir::new().unwrap();
        let gateway = unreachable_gateway(&dir);
        assert_eq!(gateway.mode(), StorageMode::CacheOnly);

        let id = gateway
            .save(EntityKind::User, &record(json!({"user_id": 42, "username": "x"})))
            .unwrap();
        assert_eq!(id, 42);
        let user = gateway.get(EntityKind::User, 42).unwrap();
        assert_eq!(user["username"], json!("x"));

        let request_id = gateway.save(EntityKind::Request, &request(42, "Dune")).unwrap();
        assert!(gateway.update(
            EntityKind::Request,
            request_id,
            &record(json!({"status": "fulfilled"}))
        ));

        let metrics = gateway.metrics();
        assert_eq!(metrics.mode, StorageMode::CacheOnly);
        assert_eq!(metrics.degraded_writes, 3);
        assert!(!gateway.is_database_connected());
    }

    #[test]
    fn test_cache_only_calls_do_not_wait_for_pool_timeout() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(ConnectionPoolManager::new(PoolConfig::new(
            dir.path().join("missing").join("gateway.db"),
        )));

        let start = Instant::now();
        let gateway = StorageGateway::new(Some(pool), GatewayConfig::default());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(gateway.mode(), StorageMode::CacheOnly);

        let start = Instant::now();
        let id = gateway
            .save(EntityKind::User, &record(json!({"user_id": 42})))
            .unwrap();
        assert_eq!(id, 42);
        assert!(start.elapsed() < Duration::from_secs(1));

        let start = Instant::now();
        assert!(gateway.get(EntityKind::User, 7).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_recovers_from_cache_only_on_next_successful_call() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir, 2);
        let gateway = StorageGateway::new(Some(Arc::clone(&pool)), GatewayConfig::default());
        assert_eq!(gateway.mode(), StorageMode::DatabaseActive);

        pool.close();
        let offline = gateway.save(EntityKind::Request, &request(1, "Offline")).unwrap();
        assert_eq!(gateway.mode(), StorageMode::CacheOnly);
        assert_eq!(gateway.metrics().degraded_writes, 1);

        pool.create_pool().unwrap();
        let online = gateway.save(EntityKind::Request, &request(1, "Online")).unwrap();
        assert_eq!(gateway.mode(), StorageMode::DatabaseActive);
        assert_eq!(gateway.metrics().degraded_writes, 1);

        let stored = pool
            .execute_query(
                "SELECT title FROM content_requests WHERE id = ?1",
                &[SqlValue::Integer(online)],
                FetchMode::One,
            )
            .unwrap()
            .into_row()
            .unwrap();
        assert_eq!(stored["title"], json!("Online"));

        // The cache-only write survives even if the store reused its id
        let offline_titles: Vec<Record> = gateway
            .cache
            .scan(EntityKind::Request, |r| r["title"] == json!("Offline"));
        assert_eq!(offline_titles.len(), 1);
        assert_eq!(gateway.get(EntityKind::Request, online).unwrap()["title"], json!("Online"));
        if offline != online {
            assert_eq!(gateway.get(EntityKind::Request, offline).unwrap()["title"], json!("Offline"));
        }
    }

    #[test]
    fn test_invalid_records_are_rejected_in_any_mode() {
        let dir = TempDir::new().unwrap();
        let gateway = unreachable_gateway(&dir);

        assert!(gateway.save(EntityKind::Request, &record(json!({"user_id": 1}))).is_err());
        assert!(gateway.save_rating(1, 2, 0, None).is_err());
        assert_eq!(gateway.cache_size(), 0);
    }

    #[test]
    fn test_update_respects_allow_list() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let id = gateway.save(EntityKind::Request, &request(7, "Dune")).unwrap();

        assert!(!gateway.update(EntityKind::Request, id, &record(json!({"title": "Hacked"}))));
        assert!(gateway.update(
            EntityKind::Request,
            id,
            &record(json!({"status": "fulfilled", "title": "Hacked", "fulfilled_by": 1}))
        ));

        gateway.clear_cache();
        let stored = gateway.get(EntityKind::Request, id).unwrap();
        assert_eq!(stored["title"], json!("Dune"));
        assert_eq!(stored["status"], json!("fulfilled"));
        assert_eq!(stored["fulfilled_by"], json!(1));
    }

    #[test]
    fn test_update_missing_entity() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        assert!(!gateway.update(EntityKind::Request, 999, &record(json!({"status": "fulfilled"}))));
    }

    #[test]
    fn test_user_upsert_keeps_counters() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);

        gateway
            .save(EntityKind::User, &record(json!({"user_id": 5, "username": "avi"})))
            .unwrap();
        assert!(gateway.update(EntityKind::User, 5, &record(json!({"total_requests": 3}))));
        gateway
            .save(EntityKind::User, &record(json!({"user_id": 5, "username": "avi_k"})))
            .unwrap();

        gateway.clear_cache();
        let user = gateway.get(EntityKind::User, 5).unwrap();
        assert_eq!(user["username"], json!("avi_k"));
        assert_eq!(user["total_requests"], json!(3));
    }

    #[test]
    fn test_rating_upsert() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let request_id = gateway.save(EntityKind::Request, &request(7, "Dune")).unwrap();

        let first = gateway.save_rating(request_id, 8, 3, Some("ok")).unwrap();
        let second = gateway.save_rating(request_id, 8, 5, None).unwrap();
        gateway.save_rating(request_id, 9, 4, None).unwrap();

        assert_eq!(first, second);
        let ratings = gateway.request_ratings(request_id);
        assert_eq!(ratings.len(), 2);
        let mine = gateway.get(EntityKind::Rating, first).unwrap();
        assert_eq!(mine["rating"], json!(5));
        assert_eq!(mine["comment"], json!("ok"));
    }

    #[test]
    fn test_query_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let first = gateway.save(EntityKind::Request, &request(1, "Dune")).unwrap();
        let second = gateway.save(EntityKind::Request, &request(1, "Dune Messiah")).unwrap();
        gateway.save(EntityKind::Request, &request(2, "Arrival")).unwrap();

        let rows = gateway
            .query(EntityKind::Request, &QueryFilter::new().eq("user_id", 1), 10)
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| get_i64(r, "id")).collect();
        assert_eq!(ids, vec![second, first]);

        let rows = gateway
            .query(EntityKind::Request, &QueryFilter::new().search("messiah"), 10)
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = gateway.query(EntityKind::Request, &QueryFilter::new(), 2).unwrap();
        assert_eq!(rows.len(), 2);

        assert!(gateway
            .query(EntityKind::Request, &QueryFilter::new().eq("no_such_column", 1), 10)
            .is_err());
        assert_eq!(gateway.user_requests(2, 10).len(), 1);
    }

    #[test]
    fn test_cache_query_fallback() {
        let dir = TempDir::new().unwrap();
        let gateway = unreachable_gateway(&dir);
        gateway.save(EntityKind::Request, &request(1, "Dune")).unwrap();
        gateway.save(EntityKind::Request, &request(1, "Arrival")).unwrap();
        gateway.save(EntityKind::Request, &request(2, "Tenet")).unwrap();

        let rows = gateway
            .query(EntityKind::Request, &QueryFilter::new().eq("user_id", 1), 10)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(gateway.metrics().fallback_reads >= 1);
    }

    #[test]
    fn test_pending_requests_priority_order() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);

        let save = |title: &str, priority: &str, category: &str| {
            let mut r = request(1, title);
            r.insert("priority".into(), json!(priority));
            r.insert("category".into(), json!(category));
            gateway.save(EntityKind::Request, &r).unwrap()
        };
        let low = save("low", "low", "movies");
        let medium = save("medium", "medium", "movies");
        let vip = save("vip", "vip", "series");
        let urgent = save("urgent", "urgent", "movies");
        let done = save("done", "vip", "movies");
        gateway.update(EntityKind::Request, done, &record(json!({"status": "fulfilled"})));

        let ids: Vec<i64> = gateway
            .pending_requests(None, 10)
            .iter()
            .map(|r| get_i64(r, "id"))
            .collect();
        assert_eq!(ids, vec![vip, urgent, medium, low]);

        let movies: Vec<i64> = gateway
            .pending_requests(Some("movies"), 2)
            .iter()
            .map(|r| get_i64(r, "id"))
            .collect();
        assert_eq!(movies, vec![urgent, medium]);
    }

    #[test]
    fn test_batch_update_is_atomic() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let a = gateway.save(EntityKind::Request, &request(1, "a")).unwrap();
        let b = gateway.save(EntityKind::Request, &request(1, "b")).unwrap();

        let changed = gateway.batch_update(
            EntityKind::Request,
            &[
                (a, record(json!({"status": "fulfilled"}))),
                (b, record(json!({"status": "rejected"}))),
            ],
        );
        assert_eq!(changed, 2);

        // NOT NULL violation on the second statement rolls back the first
        gateway.batch_update(
            EntityKind::Request,
            &[
                (a, record(json!({"notes": "kept out"}))),
                (b, record(json!({"status": null}))),
            ],
        );
        gateway.clear_cache();
        let stored = gateway.get(EntityKind::Request, a).unwrap();
        assert_eq!(stored["status"], json!("fulfilled"));
        assert_eq!(stored["notes"], Value::Null);
    }

    #[test]
    fn test_system_stats_and_invalidation() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let id = gateway.save(EntityKind::Request, &request(1, "Dune")).unwrap();
        gateway.save(EntityKind::Request, &request(2, "Tenet")).unwrap();
        gateway
            .save(EntityKind::User, &record(json!({"user_id": 1, "is_banned": 1})))
            .unwrap();
        gateway.save_rating(id, 2, 4, None).unwrap();

        let stats = gateway.system_stats();
        assert_eq!(stats.source, StatsSource::Database);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.pending_requests, 2);
        assert_eq!(stats.requests_last_24h, 2);
        assert_eq!(stats.banned_users, 1);
        assert_eq!(stats.average_rating, 4.0);

        gateway.update(EntityKind::Request, id, &record(json!({"status": "fulfilled"})));
        let stats = gateway.system_stats();
        assert_eq!(stats.pending_requests, 1);
        assert_eq!(stats.fulfillment_rate, 50.0);
    }

    #[test]
    fn test_any_write_refreshes_system_stats() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let id = gateway.save(EntityKind::Request, &request(1, "Dune")).unwrap();

        let before = gateway.system_stats();
        assert_eq!(before.total_ratings, 0);
        assert_eq!(before.total_users, 0);

        gateway.save_rating(id, 2, 5, None).unwrap();
        gateway
            .save(EntityKind::User, &record(json!({"user_id": 9, "is_banned": 1})))
            .unwrap();
        let after = gateway.system_stats();
        assert_eq!(after.total_ratings, 1);
        assert_eq!(after.average_rating, 5.0);
        assert_eq!(after.total_users, 1);
        assert_eq!(after.banned_users, 1);

        assert!(gateway.update(EntityKind::User, 9, &record(json!({"is_banned": 0}))));
        assert_eq!(gateway.system_stats().banned_users, 0);
    }

    #[test]
    fn test_user_statistics() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        let id = gateway.save(EntityKind::Request, &request(3, "Dune")).unwrap();
        gateway.save(EntityKind::Request, &request(3, "Tenet")).unwrap();
        gateway.update(EntityKind::Request, id, &record(json!({"status": "fulfilled"})));
        gateway.save_rating(id, 3, 5, None).unwrap();

        let stats = gateway.user_statistics(3);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.fulfilled_requests, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.ratings_given, 1);
        assert_eq!(stats.average_rating_given, 5.0);
        assert!(stats.first_request_at.is_some());
    }

    #[test]
    fn test_sync_cache_and_info() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir);
        gateway.save(EntityKind::Request, &request(1, "Dune")).unwrap();
        gateway.save(EntityKind::Request, &request(1, "Tenet")).unwrap();
        gateway.clear_cache();

        assert_eq!(gateway.sync_cache(), 2);
        assert_eq!(gateway.cache_size(), 2);

        let info = gateway.database_info();
        assert!(info.connected);
        assert_eq!(info.mode, StorageMode::DatabaseActive);
        assert!(info.pool.is_some_and(|p| p.pool_exists));
    }

    #[test]
    fn test_concurrent_saves_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let pool = migrated_pool(&dir, 5);
        let gateway = StorageGateway::new(Some(Arc::clone(&pool)), GatewayConfig::default());
        let before = pool.stats().total_queries;

        let mut ids: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|i| {
                    let gateway = &gateway;
                    scope.spawn(move || {
                        gateway
                            .save(EntityKind::Request, &request(i, &format!("title {}", i)))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert_eq!(gateway.metrics().degraded_writes, 0);
        assert!(pool.pool_status().stats.total_queries - before >= 10);
    }

    #[test]
    fn test_gateway_without_pool() {
        let gateway = StorageGateway::new(None, GatewayConfig::default());
        let first = gateway.save(EntityKind::Request, &request(1, "a")).unwrap();
        let second = gateway.save(EntityKind::Request, &request(1, "b")).unwrap();

        assert!(second > first);
        assert_eq!(gateway.system_stats().source, StatsSource::Cache);
        assert_eq!(gateway.system_stats().total_requests, 2);
        assert!(gateway.database_info().pool.is_none());
    }
}

//! The concrete migration units, in version order
//!
//! Every unit checks the catalog before changing anything, so re-applying a
//! unit against a store that already has its objects is harmless.

use super::catalog::{column_exists, table_exists};
use super::MigrationUnit;
use crate::pool::{ConnectionPoolManager, FetchMode};
use crate::storage::schema::*;
use crate::Result;
use tracing::{info, warn};

/// All units shipped with the crate
pub fn default_units() -> Vec<MigrationUnit> {
    vec![
        MigrationUnit::new("001", "Create basic content tables", create_basic_tables, drop_basic_tables),
        MigrationUnit::new("002", "Create extended system tables", create_extended_tables, drop_extended_tables),
        MigrationUnit::new("003", "Create cache storage table", create_cache_table, drop_cache_table),
        MigrationUnit::new("004", "Add performance indexes", add_performance_indexes, drop_performance_indexes),
        MigrationUnit::new("005", "Add request title search index", add_title_index, drop_title_index),
        MigrationUnit::new("006", "Import legacy request data", import_legacy_data, keep_legacy_data),
        MigrationUnit::new("007", "Refresh query planner statistics", analyze, noop),
        MigrationUnit::new("008", "Add request tracking columns", add_tracking_columns, drop_tracking_columns),
        MigrationUnit::new("009", "Add season column", add_season_column, drop_season_column),
        MigrationUnit::new("010", "Add episode column", add_episode_column, drop_episode_column),
    ]
}

fn exec(pool: &ConnectionPoolManager, sql: &str) -> Result<()> {
    pool.execute_query(sql, &[], FetchMode::Affected)?;
    Ok(())
}

fn exec_all(pool: &ConnectionPoolManager, statements: &[&str]) -> Result<()> {
    for sql in statements {
        exec(pool, sql)?;
    }
    Ok(())
}

fn add_column(pool: &ConnectionPoolManager, table: &str, column: &str, definition: &str) -> Result<()> {
    if column_exists(pool, table, column)? {
        info!("Column {}.{} already exists", table, column);
        return Ok(());
    }
    exec(pool, &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))?;
    info!("Added column {}.{}", table, column);
    Ok(())
}

fn drop_column(pool: &ConnectionPoolManager, table: &str, column: &str) -> Result<()> {
    if !column_exists(pool, table, column)? {
        return Ok(());
    }
    exec(pool, &format!("ALTER TABLE {} DROP COLUMN {}", table, column))?;
    info!("Dropped column {}.{}", table, column);
    Ok(())
}

fn noop(_pool: &ConnectionPoolManager) -> Result<()> {
    Ok(())
}

// ========== 001 ==========

fn create_basic_tables(pool: &ConnectionPoolManager) -> Result<()> {
    exec_all(pool, &[CREATE_REQUESTS_TABLE, CREATE_USERS_TABLE, CREATE_RATINGS_TABLE])?;
    exec_all(pool, BASIC_INDEXES)
}

fn drop_basic_tables(pool: &ConnectionPoolManager) -> Result<()> {
    exec_all(
        pool,
        &[
            "DROP TABLE IF EXISTS content_ratings",
            "DROP TABLE IF EXISTS users",
            "DROP TABLE IF EXISTS content_requests",
        ],
    )
}

// ========== 002 ==========

fn create_extended_tables(pool: &ConnectionPoolManager) -> Result<()> {
    exec_all(
        pool,
        &[
            CREATE_WARNINGS_TABLE,
            CREATE_ADMIN_ACTIONS_TABLE,
            CREATE_NOTIFICATIONS_TABLE,
            CREATE_SYSTEM_LOGS_TABLE,
        ],
    )?;
    exec_all(pool, EXTENDED_INDEXES)
}

fn drop_extended_tables(pool: &ConnectionPoolManager) -> Result<()> {
    exec_all(
        pool,
        &[
            "DROP TABLE IF EXISTS system_logs",
            "DROP TABLE IF EXISTS notifications",
            "DROP TABLE IF EXISTS admin_actions",
            "DROP TABLE IF EXISTS user_warnings",
        ],
    )
}

// ========== 003 ==========

fn create_cache_table(pool: &ConnectionPoolManager) -> Result<()> {
    exec(pool, CREATE_CACHE_TABLE)?;
    exec_all(pool, CACHE_INDEXES)
}

fn drop_cache_table(pool: &ConnectionPoolManager) -> Result<()> {
    exec(pool, "DROP TABLE IF EXISTS cache_entries")
}

// ========== 004 ==========

fn add_performance_indexes(pool: &ConnectionPoolManager) -> Result<()> {
    for (name, definition) in PERFORMANCE_INDEXES {
        exec(pool, &format!("CREATE INDEX IF NOT EXISTS {} ON {}", name, definition))?;
    }
    Ok(())
}

fn drop_performance_indexes(pool: &ConnectionPoolManager) -> Result<()> {
    for (name, _) in PERFORMANCE_INDEXES {
        exec(pool, &format!("DROP INDEX IF EXISTS {}", name))?;
    }
    Ok(())
}

// ========== 005 ==========

fn add_title_index(pool: &ConnectionPoolManager) -> Result<()> {
    exec(pool, "CREATE INDEX IF NOT EXISTS idx_requests_title ON content_requests(title)")
}

fn drop_title_index(pool: &ConnectionPoolManager) -> Result<()> {
    exec(pool, "DROP INDEX IF EXISTS idx_requests_title")
}

// ========== 006 ==========

const IMPORT_LEGACY_REQUESTS: &str = r#"
INSERT INTO content_requests (user_id, username, first_name, title, original_text, category, status, created_at)
SELECT
    user_id, username, first_name, title, COALESCE(request_text, ''),
    COALESCE(category, 'general'), COALESCE(status, 'pending'),
    COALESCE(created_at, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
FROM old_requests
WHERE NOT EXISTS (
    SELECT 1 FROM content_requests
    WHERE content_requests.user_id = old_requests.user_id
      AND content_requests.title = old_requests.title
)
"#;

// `WHERE true` keeps SQLite from parsing ON CONFLICT as a join constraint
const IMPORT_LEGACY_USERS: &str = r#"
INSERT INTO users (user_id, username, first_name, total_requests, fulfilled_requests, first_seen, last_seen)
SELECT
    user_id, MAX(username), MAX(first_name), COUNT(*),
    SUM(CASE WHEN status = 'fulfilled' THEN 1 ELSE 0 END),
    COALESCE(MIN(created_at), strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    COALESCE(MAX(created_at), strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
FROM old_requests
WHERE true
GROUP BY user_id
ON CONFLICT(user_id) DO UPDATE SET
    total_requests = excluded.total_requests,
    fulfilled_requests = excluded.fulfilled_requests
"#;

fn import_legacy_data(pool: &ConnectionPoolManager) -> Result<()> {
    if !table_exists(pool, "old_requests")? {
        info!("No legacy data to import");
        return Ok(());
    }
    let requests = pool.execute_query(IMPORT_LEGACY_REQUESTS, &[], FetchMode::Affected)?;
    info!("Imported {} legacy requests", requests.affected());
    let users = pool.execute_query(IMPORT_LEGACY_USERS, &[], FetchMode::Affected)?;
    info!("Imported statistics for {} legacy users", users.affected());
    Ok(())
}

fn keep_legacy_data(_pool: &ConnectionPoolManager) -> Result<()> {
    warn!("Imported legacy data is kept; it cannot be told apart from live data");
    Ok(())
}

// ========== 007 ==========

fn analyze(pool: &ConnectionPoolManager) -> Result<()> {
    exec(pool, "ANALYZE")?;
    info!("Query planner statistics refreshed");
    Ok(())
}

// ========== 008 - 010 ==========

const TRACKING_COLUMNS: &[(&str, &str)] = &[
    ("quality", "TEXT"),
    ("language_pref", "TEXT DEFAULT 'hebrew'"),
    ("rejected_by", "INTEGER"),
    ("rejected_at", "TEXT"),
];

fn add_tracking_columns(pool: &ConnectionPoolManager) -> Result<()> {
    for (column, definition) in TRACKING_COLUMNS {
        add_column(pool, "content_requests", column, definition)?;
    }
    Ok(())
}

fn drop_tracking_columns(pool: &ConnectionPoolManager) -> Result<()> {
    for (column, _) in TRACKING_COLUMNS.iter().rev() {
        drop_column(pool, "content_requests", column)?;
    }
    Ok(())
}

fn add_season_column(pool: &ConnectionPoolManager) -> Result<()> {
    add_column(pool, "content_requests", "season", "INTEGER")
}

fn drop_season_column(pool: &ConnectionPoolManager) -> Result<()> {
    drop_column(pool, "content_requests", "season")
}

fn add_episode_column(pool: &ConnectionPoolManager) -> Result<()> {
    add_column(pool, "content_requests", "episode", "INTEGER")
}

fn drop_episode_column(pool: &ConnectionPoolManager) -> Result<()> {
    drop_column(pool, "content_requests", "episode")
}

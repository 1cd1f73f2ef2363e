//! Catalog lookups used by defensive migration units and schema validation

use crate::pool::{ConnectionPoolManager, FetchMode, PoolError};
use crate::record::get_i64;
use rusqlite::types::Value as SqlValue;

fn count(pool: &ConnectionPoolManager, sql: &str, params: &[SqlValue]) -> Result<i64, PoolError> {
    let row = pool.execute_query(sql, params, FetchMode::One)?.into_row();
    Ok(row.map(|r| get_i64(&r, "count")).unwrap_or(0))
}

pub fn table_exists(pool: &ConnectionPoolManager, table: &str) -> Result<bool, PoolError> {
    count(
        pool,
        "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[SqlValue::Text(table.to_string())],
    )
    .map(|n| n > 0)
}

pub fn index_exists(pool: &ConnectionPoolManager, index: &str) -> Result<bool, PoolError> {
    count(
        pool,
        "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'index' AND name = ?1",
        &[SqlValue::Text(index.to_string())],
    )
    .map(|n| n > 0)
}

/// Whether `column` exists on `table`. A missing table has no columns.
pub fn column_exists(pool: &ConnectionPoolManager, table: &str, column: &str) -> Result<bool, PoolError> {
    count(
        pool,
        "SELECT COUNT(*) AS count FROM pragma_table_info(?1) WHERE name = ?2",
        &[SqlValue::Text(table.to_string()), SqlValue::Text(column.to_string())],
    )
    .map(|n| n > 0)
}

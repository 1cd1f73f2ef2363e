//! Dynamic records crossing the gateway contract
//!
//! A record is a JSON object keyed by column name. Rows read from SQLite are
//! converted into records, and record values are bound as SQL parameters.

use chrono::{SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Number, Value};

/// A row-equivalent payload: column name -> JSON value
pub type Record = Map<String, Value>;

/// Current UTC time in the store's timestamp format (RFC 3339, milliseconds).
///
/// Matches the `strftime('%Y-%m-%dT%H:%M:%fZ', 'now')` column defaults so
/// timestamps written by the gateway and by SQLite compare lexicographically.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Timestamp `hours` before now, in the store's format
pub fn timestamp_hours_ago(hours: i64) -> String {
    (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a JSON value into an SQL parameter
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null)
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested structures are stored as JSON text
        other => SqlValue::Text(other.to_string()),
    }
}

/// Convert a borrowed SQLite value into a JSON value
pub fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

/// Read every column of the current row into a record
pub fn row_to_record(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in columns.iter().enumerate() {
        record.insert(name.clone(), from_sql_ref(row.get_ref(idx)?));
    }
    Ok(record)
}

/// Integer field, tolerating floats and numeric strings. Missing -> 0.
pub fn get_i64(record: &Record, key: &str) -> i64 {
    get_opt_i64(record, key).unwrap_or(0)
}

pub fn get_opt_i64(record: &Record, key: &str) -> Option<i64> {
    match record.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_opt_f64(record: &Record, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_str<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Loose equality used by cache scans: numbers compare numerically, booleans
/// compare equal to 0/1, everything else structurally.
pub fn values_match(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
            n.as_i64() == Some(i64::from(*b))
        }
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => left == right,
    }
}

/// Round to two decimals, the precision used for rates in reports
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

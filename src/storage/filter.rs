//! Query filters shared by the SQL path and the cache scan

use crate::entity::EntityKind;
use crate::record::{get_str, to_sql_value, values_match, Record};
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Conditions for `StorageGateway::query`. All conditions must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    /// Column equality conditions
    pub equals: Vec<(String, Value)>,
    /// Case-insensitive substring over the kind's search columns
    pub search_text: Option<String>,
    /// Inclusive lower bound on the creation timestamp
    pub created_from: Option<String>,
    /// Inclusive upper bound on the creation timestamp
    pub created_to: Option<String>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.equals.push((column.to_string(), value.into()));
        self
    }

    pub fn search(mut self, text: &str) -> Self {
        self.search_text = Some(text.to_string());
        self
    }

    pub fn created_from(mut self, timestamp: &str) -> Self {
        self.created_from = Some(timestamp.to_string());
        self
    }

    pub fn created_to(mut self, timestamp: &str) -> Self {
        self.created_to = Some(timestamp.to_string());
        self
    }

    /// Build the WHERE clause and its parameters. Parameters are numbered
    /// from 1; unknown columns are rejected.
    pub(crate) fn to_sql(&self, kind: EntityKind) -> Result<(String, Vec<SqlValue>)> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        for (column, value) in &self.equals {
            if !kind.has_column(column) {
                return Err(Error::InvalidRecord(format!(
                    "unknown {} column in filter: {}",
                    kind, column
                )));
            }
            if value.is_null() {
                conditions.push(format!("{} IS NULL", column));
            } else {
                params.push(to_sql_value(value));
                conditions.push(format!("{} = ?{}", column, params.len()));
            }
        }

        if let Some(text) = self.search_text.as_deref().filter(|t| !t.is_empty()) {
            params.push(SqlValue::Text(format!("%{}%", text)));
            let n = params.len();
            let matches: Vec<String> = kind
                .search_columns()
                .iter()
                .map(|column| format!("{} LIKE ?{}", column, n))
                .collect();
            conditions.push(format!("({})", matches.join(" OR ")));
        }

        let created = kind.created_column();
        if let Some(from) = &self.created_from {
            params.push(SqlValue::Text(from.clone()));
            conditions.push(format!("{} >= ?{}", created, params.len()));
        }
        if let Some(to) = &self.created_to {
            params.push(SqlValue::Text(to.clone()));
            conditions.push(format!("{} <= ?{}", created, params.len()));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        Ok((clause, params))
    }

    /// Evaluate the filter against a cached record
    pub(crate) fn matches(&self, kind: EntityKind, record: &Record) -> bool {
        let equals = self.equals.iter().all(|(column, expected)| match record.get(column) {
            Some(actual) => values_match(actual, expected),
            None => expected.is_null(),
        });
        if !equals {
            return false;
        }

        if let Some(text) = self.search_text.as_deref().filter(|t| !t.is_empty()) {
            let needle = text.to_lowercase();
            let found = kind.search_columns().iter().any(|column| {
                get_str(record, column).is_some_and(|value| value.to_lowercase().contains(&needle))
            });
            if !found {
                return false;
            }
        }

        let created = get_str(record, kind.created_column());
        if let Some(from) = &self.created_from {
            if created.is_none_or(|c| c < from.as_str()) {
                return false;
            }
        }
        if let Some(to) = &self.created_to {
            if created.is_none_or(|c| c > to.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_numbers_parameters_in_order() {
        let filter = QueryFilter::new()
            .eq("status", "pending")
            .eq("category", "movies")
            .search("dune")
            .created_from("2024-01-01T00:00:00.000Z");

        let (clause, params) = filter.to_sql(EntityKind::Request).unwrap();
        assert_eq!(
            clause,
            "WHERE status = ?1 AND category = ?2 AND (title LIKE ?3 OR original_text LIKE ?3) AND created_at >= ?4"
        );
        assert_eq!(params.len(), 4);
        assert_eq!(params[2], SqlValue::Text("%dune%".into()));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let filter = QueryFilter::new().eq("1=1; DROP TABLE users; --", 1);
        assert!(matches!(filter.to_sql(EntityKind::User), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn test_empty_filter() {
        let (clause, params) = QueryFilter::new().to_sql(EntityKind::Rating).unwrap();
        assert!(clause.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn test_cache_matching() {
        let record = json!({
            "id": 3,
            "user_id": 9,
            "title": "Dune Part Two",
            "status": "pending",
            "created_at": "2024-05-01T12:00:00.000Z",
        });
        let record = record.as_object().unwrap();

        assert!(QueryFilter::new().eq("user_id", 9).matches(EntityKind::Request, record));
        assert!(QueryFilter::new().search("DUNE").matches(EntityKind::Request, record));
        assert!(!QueryFilter::new().eq("status", "fulfilled").matches(EntityKind::Request, record));
        assert!(
            QueryFilter::new()
                .created_from("2024-01-01T00:00:00.000Z")
                .created_to("2024-12-31T00:00:00.000Z")
                .matches(EntityKind::Request, record)
        );
        assert!(!QueryFilter::new().created_from("2025-01-01T00:00:00.000Z").matches(EntityKind::Request, record));
    }
}

//! Schema validation against the expected tables, indexes and ledger

use super::catalog::{index_exists, table_exists};
use super::{MigrationEngine, MigrationError};
use crate::storage::schema::{IMPORTANT_INDEXES, REQUIRED_TABLES};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaValidation {
    /// No missing tables and no ledger drift
    pub valid: bool,
    pub missing_tables: Vec<String>,
    pub table_issues: Vec<String>,
    /// Applied versions whose recorded checksum differs from the registered unit
    pub checksum_mismatches: Vec<String>,
    pub recommendations: Vec<String>,
}

impl MigrationEngine {
    /// Check the live schema for missing tables and important indexes, and
    /// the ledger for units whose description changed after they ran.
    pub fn validate_schema(&self) -> Result<SchemaValidation, MigrationError> {
        let pool = self.pool();
        let mut validation = SchemaValidation::default();

        for table in REQUIRED_TABLES {
            if !table_exists(pool, table)? {
                validation.missing_tables.push(table.to_string());
            }
        }
        if !validation.missing_tables.is_empty() {
            validation
                .recommendations
                .push("Run initial setup or migrations to create missing tables".to_string());
        }

        for (table, index) in IMPORTANT_INDEXES {
            if !index_exists(pool, index)? {
                validation
                    .table_issues
                    .push(format!("Missing index: {} on {}", index, table));
                validation.recommendations.push(format!(
                    "Create index {} on table {} for better performance",
                    index, table
                ));
            }
        }

        for detail in self.info()? {
            if detail.checksum_matches == Some(false) {
                validation.checksum_mismatches.push(detail.version);
            }
        }
        if !validation.checksum_mismatches.is_empty() {
            validation.recommendations.push(format!(
                "Migrations {} changed after they were applied; review them before upgrading",
                validation.checksum_mismatches.join(", ")
            ));
        }

        validation.valid = validation.missing_tables.is_empty() && validation.checksum_mismatches.is_empty();
        if !validation.valid {
            warn!(
                missing_tables = validation.missing_tables.len(),
                checksum_mismatches = validation.checksum_mismatches.len(),
                "Schema validation found problems"
            );
        }
        Ok(validation)
    }
}

//! Schema Migrations - versioned, reversible schema changes
//!
//! Each `MigrationUnit` carries a version, a description and an `up`/`down`
//! pair of plain functions over the connection pool. The engine records every
//! applied unit in the `schema_migrations` ledger table:
//! - `run` applies pending units in ascending version order
//! - `rollback_to` reverts applied units above a target in descending order
//! - both stop at the first failing unit and report it

pub mod catalog;
pub mod engine;
pub mod units;
pub mod validate;

pub use engine::{
    Direction, FailedUnit, LedgerRow, MigrationDetail, MigrationEngine, MigrationEvent,
    MigrationReport, MigrationStatus,
};
pub use units::default_units;
pub use validate::SchemaValidation;

use crate::pool::{ConnectionPoolManager, PoolError};

/// Signature of a unit's `up` / `down` step
pub type MigrationFn = fn(&ConnectionPoolManager) -> crate::Result<()>;

/// One versioned schema change
#[derive(Debug, Clone, Copy)]
pub struct MigrationUnit {
    /// Zero-padded, ordered lexicographically ("001", "002", ...)
    pub version: &'static str,
    pub description: &'static str,
    pub up: MigrationFn,
    pub down: MigrationFn,
}

impl MigrationUnit {
    pub const fn new(
        version: &'static str,
        description: &'static str,
        up: MigrationFn,
        down: MigrationFn,
    ) -> Self {
        Self {
            version,
            description,
            up,
            down,
        }
    }

    /// Ledger checksum: blake3 of version followed by description
    pub fn checksum(&self) -> String {
        checksum(self.version, self.description)
    }
}

pub(crate) fn checksum(version: &str, description: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(version.as_bytes());
    hasher.update(description.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Errors surfaced by the migration engine
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("duplicate migration version: {0}")]
    DuplicateVersion(String),

    /// The ledger references a version no registered unit provides
    #[error("no migration registered for version {0}")]
    UnknownVersion(String),

    #[error("migration {version} ({direction}) failed: {source}")]
    Unit {
        version: String,
        direction: Direction,
        #[source]
        source: Box<crate::Error>,
    },

    /// Reading or writing the ledger table failed
    #[error("migration ledger error: {0}")]
    Ledger(#[from] PoolError),
}

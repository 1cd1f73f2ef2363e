//! # Requestkeeper - persistence layer for the content-request bot
//!
//! Requestkeeper provides:
//! - A bounded, validated SQLite connection pool with query statistics
//! - A storage gateway that serves entity operations from an in-process cache
//!   and the relational store, degrading to cache-only mode during outages
//! - A versioned, reversible schema-migration engine with a ledger table
//!
//! Everything above the gateway (classification, admin reports, scheduling)
//! talks to the store through `save` / `get` / `update` / `query`.

pub mod config;
pub mod entity;
pub mod record;
pub mod pool;
pub mod migrate;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use entity::EntityKind;
pub use record::Record;
pub use pool::{ConnectionPoolManager, PoolConfig, PoolError};
pub use migrate::{MigrationEngine, MigrationError, MigrationUnit};
pub use storage::{StorageGateway, StorageMode};

/// Result type alias for Requestkeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Requestkeeper operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown entity kind: {0}")]
    UnknownEntity(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Connection Pool - bounded, validated SQLite connections
//!
//! Built on `r2d2` with a connection manager that runs a liveness query on
//! every checkout. Callers never see raw connection lifecycles:
//! - `acquire` hands out a scoped `PooledConnection` guard
//! - `execute_query` / `execute_many` / `execute_transaction` borrow one
//!   connection for the duration of the call
//! - every outcome is counted in `PoolStatistics`

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod stats;

pub use config::PoolConfig;
pub use connection::PooledConnection;
pub use error::PoolError;
pub use manager::{ConnectionPoolManager, FetchMode, PoolStatus, QueryOutput, Statement};
pub use stats::{PerformanceStats, PoolStatistics};

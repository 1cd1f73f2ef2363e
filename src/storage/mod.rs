//! Storage Layer - cache-fronted entity persistence
//!
//! System of record is SQLite with tables:
//! - content_requests(id, user_id, title, category, priority, status, ...)
//! - users(user_id, username, counters, ban state, ...)
//! - content_ratings(id, request_id, user_id, rating, comment)
//!
//! The `StorageGateway` mirrors every successful write into an in-process
//! `EntityCache` and serves from that cache alone while the store is down.

pub mod cache;
pub mod filter;
pub mod gateway;
pub mod schema;
pub mod stats;

pub use cache::EntityCache;
pub use filter::QueryFilter;
pub use gateway::{GatewayConfig, StorageGateway, StorageMode};
pub use stats::{DatabaseInfo, GatewayMetrics, StatsSource, SystemStats, UserStatistics};

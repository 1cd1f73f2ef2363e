//! Aggregate views served by the gateway

use crate::pool::{PerformanceStats, PoolStatus};
use crate::record::{get_i64, get_opt_f64, get_str, now_timestamp, round2, Record};
use serde::Serialize;

use super::StorageMode;

/// Where an aggregate was computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    /// Full data set in the store
    Database,
    /// Only what this process has seen since start
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_requests: i64,
    pub pending_requests: i64,
    pub fulfilled_requests: i64,
    pub rejected_requests: i64,
    pub requests_last_24h: i64,
    pub total_users: i64,
    pub active_users_7d: i64,
    pub banned_users: i64,
    pub total_ratings: i64,
    pub average_rating: f64,
    /// Fulfilled share of all requests, percent
    pub fulfillment_rate: f64,
    pub source: StatsSource,
    pub generated_at: String,
}

impl SystemStats {
    pub(crate) fn from_rows(requests: &Record, users: &Record, ratings: &Record, source: StatsSource) -> Self {
        let total_requests = get_i64(requests, "total_requests");
        let fulfilled_requests = get_i64(requests, "fulfilled_requests");
        Self {
            total_requests,
            pending_requests: get_i64(requests, "pending_requests"),
            fulfilled_requests,
            rejected_requests: get_i64(requests, "rejected_requests"),
            requests_last_24h: get_i64(requests, "requests_last_24h"),
            total_users: get_i64(users, "total_users"),
            active_users_7d: get_i64(users, "active_users_7d"),
            banned_users: get_i64(users, "banned_users"),
            total_ratings: get_i64(ratings, "total_ratings"),
            average_rating: round2(get_opt_f64(ratings, "average_rating").unwrap_or(0.0)),
            fulfillment_rate: percentage(fulfilled_requests, total_requests),
            source,
            generated_at: now_timestamp(),
        }
    }

    /// Aggregate over cached records
    pub(crate) fn from_cache(
        requests: &[Record],
        users: &[Record],
        ratings: &[Record],
        day_ago: &str,
        week_ago: &str,
    ) -> Self {
        let status_count = |status: &str| {
            requests
                .iter()
                .filter(|r| get_str(r, "status") == Some(status))
                .count() as i64
        };
        let total_requests = requests.len() as i64;
        let fulfilled_requests = status_count("fulfilled");
        let rating_sum: i64 = ratings.iter().map(|r| get_i64(r, "rating")).sum();

        Self {
            total_requests,
            pending_requests: status_count("pending"),
            fulfilled_requests,
            rejected_requests: status_count("rejected"),
            requests_last_24h: count_since(requests, "created_at", day_ago),
            total_users: users.len() as i64,
            active_users_7d: count_since(users, "last_seen", week_ago),
            banned_users: users.iter().filter(|u| get_i64(u, "is_banned") != 0).count() as i64,
            total_ratings: ratings.len() as i64,
            average_rating: if ratings.is_empty() {
                0.0
            } else {
                round2(rating_sum as f64 / ratings.len() as f64)
            },
            fulfillment_rate: percentage(fulfilled_requests, total_requests),
            source: StatsSource::Cache,
            generated_at: now_timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStatistics {
    pub user_id: i64,
    pub total_requests: i64,
    pub pending_requests: i64,
    pub fulfilled_requests: i64,
    pub rejected_requests: i64,
    pub requests_last_30d: i64,
    /// Fulfilled share of the user's requests, percent
    pub success_rate: f64,
    pub first_request_at: Option<String>,
    pub last_request_at: Option<String>,
    pub ratings_given: i64,
    pub average_rating_given: f64,
    pub source: StatsSource,
}

impl UserStatistics {
    pub(crate) fn from_rows(user_id: i64, requests: &Record, ratings: &Record, source: StatsSource) -> Self {
        let total_requests = get_i64(requests, "total_requests");
        let fulfilled_requests = get_i64(requests, "fulfilled_requests");
        Self {
            user_id,
            total_requests,
            pending_requests: get_i64(requests, "pending_requests"),
            fulfilled_requests,
            rejected_requests: get_i64(requests, "rejected_requests"),
            requests_last_30d: get_i64(requests, "requests_last_30d"),
            success_rate: percentage(fulfilled_requests, total_requests),
            first_request_at: get_str(requests, "first_request_at").map(String::from),
            last_request_at: get_str(requests, "last_request_at").map(String::from),
            ratings_given: get_i64(ratings, "ratings_given"),
            average_rating_given: round2(get_opt_f64(ratings, "average_rating_given").unwrap_or(0.0)),
            source,
        }
    }

    pub(crate) fn from_cache(user_id: i64, requests: &[Record], ratings: &[Record], month_ago: &str) -> Self {
        let status_count = |status: &str| {
            requests
                .iter()
                .filter(|r| get_str(r, "status") == Some(status))
                .count() as i64
        };
        let created: Vec<&str> = requests.iter().filter_map(|r| get_str(r, "created_at")).collect();
        let total_requests = requests.len() as i64;
        let fulfilled_requests = status_count("fulfilled");
        let rating_sum: i64 = ratings.iter().map(|r| get_i64(r, "rating")).sum();

        Self {
            user_id,
            total_requests,
            pending_requests: status_count("pending"),
            fulfilled_requests,
            rejected_requests: status_count("rejected"),
            requests_last_30d: count_since(requests, "created_at", month_ago),
            success_rate: percentage(fulfilled_requests, total_requests),
            first_request_at: created.iter().min().map(|s| s.to_string()),
            last_request_at: created.iter().max().map(|s| s.to_string()),
            ratings_given: ratings.len() as i64,
            average_rating_given: if ratings.is_empty() {
                0.0
            } else {
                round2(rating_sum as f64 / ratings.len() as f64)
            },
            source: StatsSource::Cache,
        }
    }
}

/// Gateway counters that make degraded durability visible
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMetrics {
    pub mode: StorageMode,
    pub cache_size: usize,
    /// Writes that landed only in the cache
    pub degraded_writes: u64,
    /// Reads answered from the cache after the store failed
    pub fallback_reads: u64,
    pub pool: Option<PerformanceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub connected: bool,
    pub mode: StorageMode,
    pub cache_size: usize,
    pub pool: Option<PoolStatus>,
}

fn percentage(part: i64, whole: i64) -> f64 {
    round2(part as f64 / whole.max(1) as f64 * 100.0)
}

fn count_since(records: &[Record], column: &str, since: &str) -> i64 {
    records
        .iter()
        .filter(|r| get_str(r, column).is_some_and(|ts| ts >= since))
        .count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_cache_aggregates() {
        let requests = vec![
            record(json!({"status": "pending", "created_at": "2024-05-02T00:00:00.000Z"})),
            record(json!({"status": "fulfilled", "created_at": "2024-05-01T00:00:00.000Z"})),
            record(json!({"status": "fulfilled", "created_at": "2024-04-01T00:00:00.000Z"})),
            record(json!({"status": "rejected", "created_at": "2024-04-01T00:00:00.000Z"})),
        ];
        let users = vec![
            record(json!({"user_id": 1, "is_banned": 1, "last_seen": "2024-05-02T00:00:00.000Z"})),
            record(json!({"user_id": 2, "is_banned": 0, "last_seen": "2024-01-01T00:00:00.000Z"})),
        ];
        let ratings = vec![record(json!({"rating": 4})), record(json!({"rating": 5}))];

        let stats = SystemStats::from_cache(
            &requests,
            &users,
            &ratings,
            "2024-05-01T12:00:00.000Z",
            "2024-04-25T00:00:00.000Z",
        );

        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.pending_requests, 1);
        assert_eq!(stats.fulfilled_requests, 2);
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.requests_last_24h, 1);
        assert_eq!(stats.active_users_7d, 1);
        assert_eq!(stats.banned_users, 1);
        assert_eq!(stats.average_rating, 4.5);
        assert_eq!(stats.fulfillment_rate, 50.0);
        assert_eq!(stats.source, StatsSource::Cache);
    }

    #[test]
    fn test_user_cache_aggregates() {
        let requests = vec![
            record(json!({"status": "fulfilled", "created_at": "2024-05-02T00:00:00.000Z"})),
            record(json!({"status": "pending", "created_at": "2024-03-01T00:00:00.000Z"})),
            record(json!({"status": "fulfilled", "created_at": "2024-04-20T00:00:00.000Z"})),
        ];

        let stats = UserStatistics::from_cache(5, &requests, &[], "2024-04-15T00:00:00.000Z");
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.requests_last_30d, 2);
        assert_eq!(stats.success_rate, 66.67);
        assert_eq!(stats.first_request_at.as_deref(), Some("2024-03-01T00:00:00.000Z"));
        assert_eq!(stats.last_request_at.as_deref(), Some("2024-05-02T00:00:00.000Z"));
        assert_eq!(stats.average_rating_given, 0.0);
    }

    #[test]
    fn test_rates_with_no_data() {
        let empty = Record::new();
        let stats = SystemStats::from_rows(&empty, &empty, &empty, StatsSource::Database);
        assert_eq!(stats.fulfillment_rate, 0.0);
        assert_eq!(stats.average_rating, 0.0);
    }
}

use crate::record::round2;
use serde::Serialize;

/// Pool counters, reset only by an explicit `reset_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub created_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
}

impl PoolStatistics {
    /// Percentage of queries that succeeded
    pub fn success_rate(&self) -> f64 {
        let queries = self.total_queries;
        let succeeded = queries.saturating_sub(self.failed_queries);
        round2(succeeded as f64 / queries.max(1) as f64 * 100.0)
    }

    /// Percentage of checkouts served without a miss
    pub fn pool_hit_rate(&self) -> f64 {
        let lookups = self.pool_hits + self.pool_misses;
        round2(self.pool_hits as f64 / lookups.max(1) as f64 * 100.0)
    }
}

/// Counters plus derived rates and the pool's configuration summary
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    #[serde(flatten)]
    pub stats: PoolStatistics,
    pub success_rate: f64,
    pub pool_hit_rate: f64,
    pub pool_name: String,
    pub pool_size: u32,
    pub reset_session: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_with_no_traffic() {
        let stats = PoolStatistics::default();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.pool_hit_rate(), 0.0);
    }

    #[test]
    fn test_rates_are_rounded_percentages() {
        let stats = PoolStatistics {
            total_queries: 3,
            failed_queries: 1,
            pool_hits: 9,
            pool_misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.success_rate(), 66.67);
        assert_eq!(stats.pool_hit_rate(), 90.0);
    }
}

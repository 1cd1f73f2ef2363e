//! Pool error taxonomy

/// Errors surfaced by the connection pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool could not be built or its test connection failed
    #[error("connection error on pool '{pool}': {reason}")]
    Connection { pool: String, reason: String },

    /// No validated connection could be handed out after the retry budget
    #[error("no connection available from pool '{pool}' after {attempts} attempt(s): {reason}")]
    Unavailable {
        pool: String,
        attempts: u32,
        reason: String,
    },

    /// A single statement failed
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A statement inside a transaction failed; the transaction was rolled back
    #[error("transaction rolled back at statement {index}: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// The pool was explicitly closed
    #[error("pool '{0}' is closed")]
    Closed(String),
}

impl PoolError {
    /// Whether the error means the store itself is unreachable, as opposed to
    /// a bad statement against a reachable store
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            PoolError::Connection { .. } | PoolError::Unavailable { .. } | PoolError::Closed(_)
        )
    }
}

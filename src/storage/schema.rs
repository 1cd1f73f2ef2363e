//! Database schema definitions
//!
//! Timestamps are TEXT in RFC 3339 UTC with millisecond precision, the same
//! format `record::now_timestamp` produces.

/// SQL to create the migration ledger
pub const CREATE_LEDGER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    executed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    checksum TEXT NOT NULL
)
"#;

/// SQL to create the content_requests table.
/// quality, language_pref, rejected_by, rejected_at, season and episode are
/// added by later migrations.
pub const CREATE_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS content_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    username TEXT,
    first_name TEXT,
    title TEXT NOT NULL,
    original_text TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT 'general',
    priority TEXT NOT NULL DEFAULT 'medium',
    status TEXT NOT NULL DEFAULT 'pending',
    confidence REAL NOT NULL DEFAULT 50,
    year INTEGER,
    notes TEXT,
    rejection_reason TEXT,
    fulfilled_at TEXT,
    fulfilled_by INTEGER,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// SQL to create the users table, keyed by the chat user id
pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    total_requests INTEGER NOT NULL DEFAULT 0,
    fulfilled_requests INTEGER NOT NULL DEFAULT 0,
    rejected_requests INTEGER NOT NULL DEFAULT 0,
    reputation_score INTEGER NOT NULL DEFAULT 50,
    is_banned INTEGER NOT NULL DEFAULT 0,
    ban_reason TEXT,
    ban_until TEXT,
    warnings_count INTEGER NOT NULL DEFAULT 0,
    first_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    last_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    last_request_at TEXT,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// SQL to create the content_ratings table (one rating per user per request)
pub const CREATE_RATINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS content_ratings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES content_requests(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    comment TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(request_id, user_id)
)
"#;

pub const CREATE_WARNINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_warnings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    admin_id INTEGER,
    reason TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'low',
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

pub const CREATE_ADMIN_ACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS admin_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    admin_id INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    target_type TEXT,
    target_id INTEGER,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

pub const CREATE_NOTIFICATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id INTEGER NOT NULL,
    notification_type TEXT NOT NULL,
    title TEXT,
    message TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_sent INTEGER NOT NULL DEFAULT 0,
    scheduled_for TEXT,
    sent_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

pub const CREATE_SYSTEM_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    source TEXT,
    message TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// Persistent key/value cache storage
pub const CREATE_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    cache_value TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// Indexes created with the basic tables
pub const BASIC_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_requests_user ON content_requests(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_requests_status ON content_requests(status)",
    "CREATE INDEX IF NOT EXISTS idx_requests_category ON content_requests(category)",
    "CREATE INDEX IF NOT EXISTS idx_requests_created ON content_requests(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_users_username ON users(username)",
    "CREATE INDEX IF NOT EXISTS idx_users_banned ON users(is_banned)",
];

/// Indexes created with the extended tables
pub const EXTENDED_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_warnings_user ON user_warnings(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id)",
    "CREATE INDEX IF NOT EXISTS idx_system_logs_level ON system_logs(level, created_at)",
];

pub const CACHE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at)",
];

/// Composite indexes: (name, definition)
pub const PERFORMANCE_INDEXES: &[(&str, &str)] = &[
    ("idx_requests_status_created", "content_requests(status, created_at)"),
    ("idx_requests_user_status", "content_requests(user_id, status)"),
    ("idx_requests_category_status", "content_requests(category, status)"),
    ("idx_users_active", "users(last_request_at, is_banned)"),
    ("idx_users_reputation", "users(reputation_score, total_requests)"),
    ("idx_ratings_request_rating", "content_ratings(request_id, rating)"),
    ("idx_warnings_user_active", "user_warnings(user_id, is_active)"),
    ("idx_warnings_severity", "user_warnings(severity, created_at)"),
    ("idx_notifications_recipient_read", "notifications(recipient_id, is_read)"),
    ("idx_notifications_scheduled", "notifications(scheduled_for, is_sent)"),
];

/// Tables a fully migrated store must have
pub const REQUIRED_TABLES: &[&str] = &[
    "content_requests",
    "users",
    "content_ratings",
    "user_warnings",
    "admin_actions",
    "notifications",
    "system_logs",
    "cache_entries",
];

/// Indexes whose absence hurts the hot query paths: (table, index)
pub const IMPORTANT_INDEXES: &[(&str, &str)] = &[
    ("content_requests", "idx_requests_user"),
    ("content_requests", "idx_requests_status"),
    ("users", "idx_users_username"),
];

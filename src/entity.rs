//! Entity kinds served by the storage gateway
//!
//! Every kind maps to one table. The column lists here are the single source
//! of truth for what the gateway will ever bind into SQL: record keys outside
//! these lists are dropped, so callers cannot inject column names.

use crate::record::{now_timestamp, Record};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Entity kinds persisted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Content request submitted by a user
    Request,
    /// Bot user profile and counters, keyed by the chat user id
    User,
    /// 1-5 rating a user gave to a fulfilled request
    Rating,
}

impl EntityKind {
    /// Get the string representation of the entity kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Request => "request",
            EntityKind::User => "user",
            EntityKind::Rating => "rating",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Request => "content_requests",
            EntityKind::User => "users",
            EntityKind::Rating => "content_ratings",
        }
    }

    /// Primary key column
    pub fn key_column(&self) -> &'static str {
        match self {
            EntityKind::User => "user_id",
            EntityKind::Request | EntityKind::Rating => "id",
        }
    }

    /// Whether the store assigns the key. Users are keyed by the caller.
    pub fn store_assigns_key(&self) -> bool {
        !matches!(self, EntityKind::User)
    }

    /// Columns a caller may write on insert (the key included for users)
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Request => &[
                "user_id",
                "username",
                "first_name",
                "title",
                "original_text",
                "category",
                "priority",
                "status",
                "confidence",
                "year",
                "season",
                "episode",
                "quality",
                "language_pref",
                "notes",
                "rejection_reason",
                "fulfilled_at",
                "fulfilled_by",
                "rejected_at",
                "rejected_by",
                "created_at",
                "updated_at",
            ],
            EntityKind::User => &[
                "user_id",
                "username",
                "first_name",
                "last_name",
                "total_requests",
                "fulfilled_requests",
                "rejected_requests",
                "reputation_score",
                "is_banned",
                "ban_reason",
                "ban_until",
                "warnings_count",
                "first_seen",
                "last_seen",
                "last_request_at",
                "updated_at",
            ],
            EntityKind::Rating => &[
                "request_id",
                "user_id",
                "rating",
                "comment",
                "created_at",
                "updated_at",
            ],
        }
    }

    /// Fields `update` may touch. `updated_at` is attached automatically.
    pub fn updatable_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Request => &[
                "status",
                "fulfilled_at",
                "fulfilled_by",
                "rejected_at",
                "rejected_by",
                "notes",
                "rejection_reason",
                "priority",
                "updated_at",
            ],
            EntityKind::User => &[
                "username",
                "first_name",
                "last_name",
                "total_requests",
                "fulfilled_requests",
                "rejected_requests",
                "reputation_score",
                "is_banned",
                "ban_reason",
                "ban_until",
                "warnings_count",
                "last_seen",
                "last_request_at",
                "updated_at",
            ],
            EntityKind::Rating => &["rating", "comment", "updated_at"],
        }
    }

    /// Columns that must be present on save
    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Request => &["user_id", "title"],
            EntityKind::User => &["user_id"],
            EntityKind::Rating => &["request_id", "user_id", "rating"],
        }
    }

    /// Natural key for upserts, if the kind has one
    pub fn conflict_target(&self) -> Option<&'static [&'static str]> {
        match self {
            EntityKind::Request => None,
            EntityKind::User => Some(&["user_id"]),
            EntityKind::Rating => Some(&["request_id", "user_id"]),
        }
    }

    /// Column recording when the entity first appeared
    pub fn created_column(&self) -> &'static str {
        match self {
            EntityKind::User => "first_seen",
            EntityKind::Request | EntityKind::Rating => "created_at",
        }
    }

    /// Free-text columns matched by `QueryFilter::search_text`
    pub fn search_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Request => &["title", "original_text"],
            EntityKind::User => &["username", "first_name", "last_name"],
            EntityKind::Rating => &["comment"],
        }
    }

    /// Whether `column` is a real column of this kind's table
    pub fn has_column(&self, column: &str) -> bool {
        column == self.key_column() || self.columns().contains(&column)
    }

    /// Keep known columns, apply defaults, stamp timestamps and validate
    /// required fields. The result is what both the store and the cache see.
    pub fn prepare_insert(&self, record: &Record) -> Result<Record> {
        let mut prepared: Record = record
            .iter()
            .filter(|(k, _)| self.columns().contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for column in self.required_columns() {
            match prepared.get(*column) {
                None | Some(Value::Null) => {
                    return Err(Error::InvalidRecord(format!(
                        "{} is missing required field '{}'",
                        self, column
                    )));
                }
                Some(_) => {}
            }
        }

        let now = now_timestamp();
        match self {
            EntityKind::Request => {
                set_default(&mut prepared, "original_text", Value::from(""));
                set_default(&mut prepared, "category", Value::from("general"));
                set_default(&mut prepared, "priority", Value::from("medium"));
                set_default(&mut prepared, "status", Value::from("pending"));
                set_default(&mut prepared, "confidence", Value::from(50));
                set_default(&mut prepared, "language_pref", Value::from("hebrew"));
                set_default(&mut prepared, "created_at", Value::from(now.clone()));
            }
            EntityKind::User => {
                set_default(&mut prepared, "total_requests", Value::from(0));
                set_default(&mut prepared, "fulfilled_requests", Value::from(0));
                set_default(&mut prepared, "rejected_requests", Value::from(0));
                set_default(&mut prepared, "reputation_score", Value::from(50));
                set_default(&mut prepared, "is_banned", Value::from(0));
                set_default(&mut prepared, "warnings_count", Value::from(0));
                set_default(&mut prepared, "first_seen", Value::from(now.clone()));
                set_default(&mut prepared, "last_seen", Value::from(now.clone()));
            }
            EntityKind::Rating => {
                let rating = crate::record::get_i64(&prepared, "rating");
                if !(1..=5).contains(&rating) {
                    return Err(Error::InvalidRecord(format!(
                        "rating must be between 1 and 5, got {}",
                        rating
                    )));
                }
                set_default(&mut prepared, "created_at", Value::from(now.clone()));
            }
        }
        prepared.insert("updated_at".to_string(), Value::from(now));

        Ok(prepared)
    }

    /// Keep only allow-listed fields and attach `updated_at`.
    /// Returns `None` when nothing updatable was supplied.
    pub fn prepare_update(&self, fields: &Record) -> Option<Record> {
        let mut prepared: Record = fields
            .iter()
            .filter(|(k, _)| self.updatable_columns().contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if prepared.is_empty() {
            return None;
        }
        prepared.insert("updated_at".to_string(), Value::from(now_timestamp()));
        Some(prepared)
    }
}

fn set_default(record: &mut Record, key: &str, value: Value) {
    match record.get(key) {
        None | Some(Value::Null) => {
            record.insert(key.to_string(), value);
        }
        Some(_) => {}
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "request" | "requests" | "content_request" | "content_requests" => Ok(EntityKind::Request),
            "user" | "users" => Ok(EntityKind::User),
            "rating" | "ratings" | "content_rating" | "content_ratings" => Ok(EntityKind::Rating),
            _ => Err(Error::UnknownEntity(s.to_string())),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

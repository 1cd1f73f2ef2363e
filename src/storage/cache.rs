//! In-process entity cache
//!
//! Holds the last known-good record per `(kind, id)`. Ids for entities created
//! while the store is unreachable come from a separate atomic counter, so
//! allocation never serializes behind the map lock longer than one insert.
//! Such entries stay marked as local until the store supplies a row for them.

use crate::entity::EntityKind;
use crate::record::{get_opt_i64, values_match, Record};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

type CacheKey = (EntityKind, i64);

#[derive(Debug, Default)]
struct Entries {
    records: HashMap<CacheKey, Record>,
    /// Written while the store was unreachable
    local: HashSet<CacheKey>,
}

impl Entries {
    fn insert_local(&mut self, kind: EntityKind, id: i64, mut record: Record) {
        record.insert(kind.key_column().to_string(), Value::from(id));
        self.records.insert((kind, id), record);
        self.local.insert((kind, id));
    }
}

#[derive(Debug, Default)]
pub struct EntityCache {
    entries: RwLock<Entries>,
    last_local_id: AtomicI64,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_local_id(&self, entries: &Entries, kind: EntityKind) -> i64 {
        loop {
            let candidate = self.last_local_id.fetch_add(1, Ordering::SeqCst) + 1;
            if !entries.records.contains_key(&(kind, candidate)) {
                return candidate;
            }
        }
    }

    pub fn get(&self, kind: EntityKind, id: i64) -> Option<Record> {
        self.read().records.get(&(kind, id)).cloned()
    }

    /// Whether `(kind, id)` holds a write the store has not seen
    pub fn is_local(&self, kind: EntityKind, id: i64) -> bool {
        self.read().local.contains(&(kind, id))
    }

    /// Store `record`, a row supplied by the store, as the known-good state
    /// of `(kind, id)`.
    ///
    /// A store-assigned id can match a local id handed out during an outage.
    /// The local entry is then moved to a fresh local id instead of being
    /// overwritten.
    pub fn put(&self, kind: EntityKind, id: i64, record: Record) {
        let mut entries = self.write();
        let key = (kind, id);
        if kind.store_assigns_key() {
            // Keep local ids ahead of anything the store handed out
            self.last_local_id.fetch_max(id, Ordering::SeqCst);
            if entries.local.remove(&key) {
                if let Some(displaced) = entries.records.remove(&key) {
                    let moved_to = self.next_local_id(&entries, kind);
                    warn!("Store assigned {} id {} held by a cache-only entry; moved it to {}", kind, id, moved_to);
                    entries.insert_local(kind, moved_to, displaced);
                }
            }
        } else {
            entries.local.remove(&key);
        }
        entries.records.insert(key, record);
    }

    /// Merge `fields` into an existing entry. Returns false if nothing is cached.
    pub fn merge(&self, kind: EntityKind, id: i64, fields: &Record) -> bool {
        match self.write().records.get_mut(&(kind, id)) {
            Some(existing) => {
                for (key, value) in fields {
                    existing.insert(key.clone(), value.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry, returning how many were held
    pub fn clear(&self) -> usize {
        let mut entries = self.write();
        let count = entries.records.len();
        entries.records.clear();
        entries.local.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.read().records.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Cached records of `kind` accepted by `predicate`
    pub fn scan(&self, kind: EntityKind, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.read()
            .records
            .iter()
            .filter(|(key, record)| key.0 == kind && predicate(*record))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Save without the store.
    ///
    /// An entry with the same natural key is updated in place with the
    /// `update_columns` of `record`; otherwise the record is inserted, under
    /// its own key for caller-keyed kinds or under a fresh local id.
    pub fn save_local(&self, kind: EntityKind, record: Record, update_columns: &[String]) -> i64 {
        let mut entries = self.write();

        if let Some(target) = kind.conflict_target() {
            let existing = entries.records.iter_mut().find(|((k, _), cached)| {
                *k == kind
                    && target.iter().all(|column| match (cached.get(*column), record.get(*column)) {
                        (Some(a), Some(b)) => values_match(a, b),
                        _ => false,
                    })
            });
            if let Some(((_, id), cached)) = existing {
                for column in update_columns {
                    if let Some(value) = record.get(column) {
                        cached.insert(column.clone(), value.clone());
                    }
                }
                return *id;
            }
        }

        let id = match (kind.store_assigns_key(), get_opt_i64(&record, kind.key_column())) {
            (false, Some(id)) => id,
            _ => self.next_local_id(&entries, kind),
        };
        entries.insert_local(kind, id, record);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_local_ids_are_monotonic_and_skip_taken_ids() {
        let cache = EntityCache::new();
        cache.put(EntityKind::Request, 7, record(json!({"id": 7, "title": "stored"})));

        let first = cache.save_local(EntityKind::Request, record(json!({"title": "a"})), &[]);
        let second = cache.save_local(EntityKind::Request, record(json!({"title": "b"})), &[]);

        assert!(first > 7);
        assert!(second > first);
        assert_eq!(cache.get(EntityKind::Request, first).unwrap()["id"], json!(first));
        assert_eq!(cache.get(EntityKind::Request, 7).unwrap()["title"], json!("stored"));
    }

    #[test]
    fn test_caller_keyed_entities_use_their_key() {
        let cache = EntityCache::new();
        let id = cache.save_local(EntityKind::User, record(json!({"user_id": 42, "username": "dana"})), &[]);
        assert_eq!(id, 42);

        let updated = vec!["username".to_string()];
        let again = cache.save_local(
            EntityKind::User,
            record(json!({"user_id": 42, "username": "dana_k", "total_requests": 0})),
            &updated,
        );
        assert_eq!(again, 42);
        assert_eq!(cache.count(EntityKind::User), 1);
        assert_eq!(cache.get(EntityKind::User, 42).unwrap()["username"], json!("dana_k"));
    }

    #[test]
    fn test_ratings_upsert_on_natural_key() {
        let cache = EntityCache::new();
        let update = vec!["rating".to_string()];
        let first = cache.save_local(
            EntityKind::Rating,
            record(json!({"request_id": 1, "user_id": 2, "rating": 3})),
            &update,
        );
        let second = cache.save_local(
            EntityKind::Rating,
            record(json!({"request_id": 1, "user_id": 2, "rating": 5})),
            &update,
        );
        let other = cache.save_local(
            EntityKind::Rating,
            record(json!({"request_id": 1, "user_id": 3, "rating": 4})),
            &update,
        );

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(cache.get(EntityKind::Rating, first).unwrap()["rating"], json!(5));
    }

    #[test]
    fn test_concurrent_local_saves_never_collide() {
        let cache = EntityCache::new();
        let mut ids: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let cache = &cache;
                    scope.spawn(move || cache.save_local(EntityKind::Request, record(json!({"title": i})), &[]))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_store_row_never_overwrites_cache_only_write() {
        let cache = EntityCache::new();
        let local = cache.save_local(EntityKind::Request, record(json!({"title": "offline"})), &[]);
        assert!(cache.is_local(EntityKind::Request, local));

        // The store, back online, hands out the same id for another request
        cache.put(EntityKind::Request, local, record(json!({"id": local, "title": "online"})));

        assert!(!cache.is_local(EntityKind::Request, local));
        assert_eq!(cache.get(EntityKind::Request, local).unwrap()["title"], json!("online"));
        let moved = cache.scan(EntityKind::Request, |r| r["title"] == json!("offline"));
        assert_eq!(moved.len(), 1);
        let moved_id = moved[0]["id"].as_i64().unwrap();
        assert!(moved_id > local);
        assert!(cache.is_local(EntityKind::Request, moved_id));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_store_row_replaces_local_user() {
        let cache = EntityCache::new();
        cache.save_local(EntityKind::User, record(json!({"user_id": 42, "username": "x"})), &[]);
        cache.put(EntityKind::User, 42, record(json!({"user_id": 42, "username": "x", "total_requests": 0})));

        assert!(!cache.is_local(EntityKind::User, 42));
        assert_eq!(cache.count(EntityKind::User), 1);
    }

    #[test]
    fn test_merge_and_clear() {
        let cache = EntityCache::new();
        cache.put(EntityKind::Request, 1, record(json!({"id": 1, "status": "pending"})));

        assert!(cache.merge(EntityKind::Request, 1, &record(json!({"status": "fulfilled"}))));
        assert!(!cache.merge(EntityKind::Request, 2, &record(json!({"status": "fulfilled"}))));
        assert_eq!(cache.get(EntityKind::Request, 1).unwrap()["status"], json!("fulfilled"));

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }
}

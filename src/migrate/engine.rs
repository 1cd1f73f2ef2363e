//! MigrationEngine implementation

use super::{MigrationError, MigrationUnit};
use crate::pool::{ConnectionPoolManager, FetchMode};
use crate::record::{get_opt_i64, get_str, now_timestamp};
use crate::storage::schema::CREATE_LEDGER_TABLE;
use crossbeam::channel::Sender;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Which way a batch moves the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Progress notifications, streamed to an optional channel
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    Planned { direction: Direction, total: usize },
    Started { version: String, description: String },
    Finished { version: String, elapsed_ms: u64 },
    Failed { version: String, error: String },
    Completed { direction: Direction, completed: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub version: String,
    pub error: String,
}

/// Outcome of `run` or `rollback_to`
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub direction: Direction,
    /// Versions the batch intended to process, in processing order
    pub planned: Vec<String>,
    pub completed: Vec<String>,
    /// The unit that stopped the batch
    pub failed: Option<FailedUnit>,
}

impl MigrationReport {
    fn new(direction: Direction, planned: Vec<String>) -> Self {
        Self {
            direction,
            planned,
            completed: Vec::new(),
            failed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Nothing was pending
    pub fn is_noop(&self) -> bool {
        self.planned.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub current_version: Option<String>,
    pub executed_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub all_versions: Vec<String>,
    pub total_migrations: usize,
    pub executed_count: usize,
    pub pending_count: usize,
}

/// One `schema_migrations` row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub version: String,
    pub description: String,
    pub executed_at: String,
    pub execution_time_ms: i64,
    pub checksum: String,
}

/// Per-unit view combining the registry and the ledger
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDetail {
    pub version: String,
    pub description: String,
    pub executed: bool,
    pub executed_at: Option<String>,
    pub execution_time_ms: Option<i64>,
    /// `None` when the unit has not run
    pub checksum_matches: Option<bool>,
}

/// Applies and reverts registered units against the store, keeping the ledger
/// in step with what actually ran.
pub struct MigrationEngine {
    pool: Arc<ConnectionPoolManager>,
    units: Vec<MigrationUnit>,
    events: Option<Sender<MigrationEvent>>,
}

impl MigrationEngine {
    /// Register `units` (sorted by version) and make sure the ledger exists
    pub fn new(pool: Arc<ConnectionPoolManager>, mut units: Vec<MigrationUnit>) -> Result<Self, MigrationError> {
        units.sort_by(|a, b| a.version.cmp(b.version));
        if let Some(pair) = units.windows(2).find(|pair| pair[0].version == pair[1].version) {
            return Err(MigrationError::DuplicateVersion(pair[0].version.to_string()));
        }

        let engine = Self {
            pool,
            units,
            events: None,
        };
        engine.pool.execute_query(CREATE_LEDGER_TABLE, &[], FetchMode::Affected)?;
        Ok(engine)
    }

    /// Stream progress events to `sender`
    pub fn with_events(mut self, sender: Sender<MigrationEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    fn find(&self, version: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|unit| unit.version == version)
    }

    fn emit(&self, event: MigrationEvent) {
        if let Some(sender) = &self.events {
            // A dropped receiver only means nobody is watching
            let _ = sender.send(event);
        }
    }

    // ========== Ledger ==========

    pub fn ledger(&self) -> Result<Vec<LedgerRow>, MigrationError> {
        let rows = self
            .pool
            .execute_query(
                "SELECT version, description, executed_at, execution_time_ms, checksum \
                 FROM schema_migrations ORDER BY version",
                &[],
                FetchMode::All,
            )?
            .into_rows();

        Ok(rows
            .iter()
            .map(|row| LedgerRow {
                version: get_str(row, "version").unwrap_or_default().to_string(),
                description: get_str(row, "description").unwrap_or_default().to_string(),
                executed_at: get_str(row, "executed_at").unwrap_or_default().to_string(),
                execution_time_ms: get_opt_i64(row, "execution_time_ms").unwrap_or(0),
                checksum: get_str(row, "checksum").unwrap_or_default().to_string(),
            })
            .collect())
    }

    /// Applied versions, ascending
    pub fn executed_versions(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self.ledger()?.into_iter().map(|row| row.version).collect())
    }

    /// Most recently applied version; ties on `executed_at` go to the higher version
    pub fn current_version(&self) -> Result<Option<String>, MigrationError> {
        let row = self
            .pool
            .execute_query(
                "SELECT version FROM schema_migrations ORDER BY executed_at DESC, version DESC LIMIT 1",
                &[],
                FetchMode::One,
            )?
            .into_row();
        Ok(row.and_then(|r| get_str(&r, "version").map(String::from)))
    }

    /// Registered units absent from the ledger, up to `target` inclusive
    pub fn pending(&self, target: Option<&str>) -> Result<Vec<MigrationUnit>, MigrationError> {
        let executed = self.executed_versions()?;
        Ok(self
            .units
            .iter()
            .filter(|unit| !executed.iter().any(|v| v == unit.version))
            .filter(|unit| target.is_none_or(|t| unit.version <= t))
            .copied()
            .collect())
    }

    fn record(&self, unit: &MigrationUnit, elapsed_ms: u64) -> Result<(), MigrationError> {
        self.pool.execute_query(
            "INSERT INTO schema_migrations (version, description, executed_at, execution_time_ms, checksum) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(version) DO UPDATE SET \
                description = excluded.description, \
                executed_at = excluded.executed_at, \
                execution_time_ms = excluded.execution_time_ms, \
                checksum = excluded.checksum",
            &[
                SqlValue::Text(unit.version.to_string()),
                SqlValue::Text(unit.description.to_string()),
                SqlValue::Text(now_timestamp()),
                SqlValue::Integer(i64::try_from(elapsed_ms).unwrap_or(i64::MAX)),
                SqlValue::Text(unit.checksum()),
            ],
            FetchMode::Affected,
        )?;
        Ok(())
    }

    fn remove_record(&self, version: &str) -> Result<(), MigrationError> {
        self.pool.execute_query(
            "DELETE FROM schema_migrations WHERE version = ?1",
            &[SqlValue::Text(version.to_string())],
            FetchMode::Affected,
        )?;
        Ok(())
    }

    // ========== Execution ==========

    /// Apply pending units up to `target` (all when `None`), ascending.
    ///
    /// Stops at the first failing unit; units applied before it stay applied
    /// and recorded. A second run with nothing pending is a no-op.
    pub fn run(&self, target: Option<&str>) -> Result<MigrationReport, MigrationError> {
        let pending = self.pending(target)?;
        let mut report = MigrationReport::new(
            Direction::Up,
            pending.iter().map(|unit| unit.version.to_string()).collect(),
        );

        if pending.is_empty() {
            info!("Database is up to date");
            return Ok(report);
        }

        info!("Running {} migrations", pending.len());
        self.emit(MigrationEvent::Planned {
            direction: Direction::Up,
            total: pending.len(),
        });

        for unit in &pending {
            match self.apply(unit, Direction::Up) {
                Ok(()) => report.completed.push(unit.version.to_string()),
                Err(e) => {
                    self.fail(&mut report, unit.version, &e);
                    break;
                }
            }
        }

        self.finish(&report);
        Ok(report)
    }

    /// Revert applied units with a version above `target`, descending.
    /// Each reverted unit's ledger row is removed. Stops at the first failure.
    pub fn rollback_to(&self, target: &str) -> Result<MigrationReport, MigrationError> {
        let mut to_revert: Vec<String> = self
            .executed_versions()?
            .into_iter()
            .filter(|version| version.as_str() > target)
            .collect();
        to_revert.sort_by(|a, b| b.cmp(a));

        let mut report = MigrationReport::new(Direction::Down, to_revert.clone());
        if to_revert.is_empty() {
            info!("Nothing to roll back above version {}", target);
            return Ok(report);
        }

        let current = self.current_version()?;
        warn!(
            "Rolling back database from {} to {}",
            current.as_deref().unwrap_or("none"),
            target
        );
        self.emit(MigrationEvent::Planned {
            direction: Direction::Down,
            total: to_revert.len(),
        });

        for version in &to_revert {
            let result = match self.find(version) {
                Some(unit) => self.apply(unit, Direction::Down),
                None => Err(MigrationError::UnknownVersion(version.clone())),
            };
            match result {
                Ok(()) => report.completed.push(version.clone()),
                Err(e) => {
                    self.fail(&mut report, version, &e);
                    break;
                }
            }
        }

        self.finish(&report);
        Ok(report)
    }

    fn apply(&self, unit: &MigrationUnit, direction: Direction) -> Result<(), MigrationError> {
        match direction {
            Direction::Up => info!("Executing migration {}: {}", unit.version, unit.description),
            Direction::Down => info!("Rolling back migration {}: {}", unit.version, unit.description),
        }
        self.emit(MigrationEvent::Started {
            version: unit.version.to_string(),
            description: unit.description.to_string(),
        });

        let start = Instant::now();
        let step = match direction {
            Direction::Up => unit.up,
            Direction::Down => unit.down,
        };
        step(&self.pool).map_err(|source| MigrationError::Unit {
            version: unit.version.to_string(),
            direction,
            source: Box::new(source),
        })?;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match direction {
            Direction::Up => self.record(unit, elapsed_ms)?,
            Direction::Down => self.remove_record(unit.version)?,
        }

        info!("Migration {} {} completed in {}ms", unit.version, direction, elapsed_ms);
        self.emit(MigrationEvent::Finished {
            version: unit.version.to_string(),
            elapsed_ms,
        });
        Ok(())
    }

    fn fail(&self, report: &mut MigrationReport, version: &str, e: &MigrationError) {
        error!("Migration {} failed: {}", version, e);
        self.emit(MigrationEvent::Failed {
            version: version.to_string(),
            error: e.to_string(),
        });
        report.failed = Some(FailedUnit {
            version: version.to_string(),
            error: e.to_string(),
        });
    }

    fn finish(&self, report: &MigrationReport) {
        self.emit(MigrationEvent::Completed {
            direction: report.direction,
            completed: report.completed.len(),
        });
    }

    // ========== Reporting ==========

    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let executed_versions = self.executed_versions()?;
        let pending_versions: Vec<String> = self
            .pending(None)?
            .iter()
            .map(|unit| unit.version.to_string())
            .collect();
        let all_versions: Vec<String> = self.units.iter().map(|unit| unit.version.to_string()).collect();

        Ok(MigrationStatus {
            current_version: self.current_version()?,
            total_migrations: all_versions.len(),
            executed_count: executed_versions.len(),
            pending_count: pending_versions.len(),
            executed_versions,
            pending_versions,
            all_versions,
        })
    }

    /// Registered units with their ledger details
    pub fn info(&self) -> Result<Vec<MigrationDetail>, MigrationError> {
        let ledger = self.ledger()?;
        Ok(self
            .units
            .iter()
            .map(|unit| {
                let row = ledger.iter().find(|row| row.version == unit.version);
                MigrationDetail {
                    version: unit.version.to_string(),
                    description: unit.description.to_string(),
                    executed: row.is_some(),
                    executed_at: row.map(|r| r.executed_at.clone()),
                    execution_time_ms: row.map(|r| r.execution_time_ms),
                    checksum_matches: row.map(|r| r.checksum == unit.checksum()),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::catalog::{index_exists, table_exists};
    use crate::migrate::default_units;
    use crate::pool::PoolConfig;
    use tempfile::TempDir;

    fn test_pool(dir: &TempDir) -> Arc<ConnectionPoolManager> {
        Arc::new(ConnectionPoolManager::new(PoolConfig::new(dir.path().join("migrate.db"))))
    }

    fn first_five() -> Vec<MigrationUnit> {
        default_units().into_iter().take(5).collect()
    }

    fn create_alpha(pool: &ConnectionPoolManager) -> crate::Result<()> {
        pool.execute_query("CREATE TABLE IF NOT EXISTS alpha (id INTEGER)", &[], FetchMode::Affected)?;
        Ok(())
    }

    fn drop_alpha(pool: &ConnectionPoolManager) -> crate::Result<()> {
        pool.execute_query("DROP TABLE IF EXISTS alpha", &[], FetchMode::Affected)?;
        Ok(())
    }

    fn broken(pool: &ConnectionPoolManager) -> crate::Result<()> {
        pool.execute_query("CREATE TABLE", &[], FetchMode::Affected)?;
        Ok(())
    }

    fn create_gamma(pool: &ConnectionPoolManager) -> crate::Result<()> {
        pool.execute_query("CREATE TABLE IF NOT EXISTS gamma (id INTEGER)", &[], FetchMode::Affected)?;
        Ok(())
    }

    fn noop(_pool: &ConnectionPoolManager) -> crate::Result<()> {
        Ok(())
    }

    #[test]
    fn test_run_applies_everything_in_order() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let engine = MigrationEngine::new(Arc::clone(&pool), default_units()).unwrap();

        let report = engine.run(None).unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed, report.planned);
        assert_eq!(report.completed.first().map(String::as_str), Some("001"));
        assert_eq!(report.completed.last().map(String::as_str), Some("010"));

        let status = engine.status().unwrap();
        assert_eq!(status.current_version.as_deref(), Some("010"));
        assert_eq!(status.executed_count, 10);
        assert_eq!(status.pending_count, 0);
        assert!(table_exists(&pool, "cache_entries").unwrap());
    }

    #[test]
    fn test_second_run_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = MigrationEngine::new(test_pool(&dir), default_units()).unwrap();

        engine.run(None).unwrap();
        let ledger_before = engine.ledger().unwrap();

        let report = engine.run(None).unwrap();
        assert!(report.is_noop());
        assert!(report.is_success());
        assert_eq!(engine.ledger().unwrap(), ledger_before);
    }

    #[test]
    fn test_status_and_rollback_on_first_five() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let engine = MigrationEngine::new(Arc::clone(&pool), first_five()).unwrap();

        engine.run(None).unwrap();
        let status = engine.status().unwrap();
        assert_eq!(status.current_version.as_deref(), Some("005"));
        assert_eq!(status.executed_count, 5);
        assert_eq!(status.pending_count, 0);

        let report = engine.rollback_to("003").unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed, vec!["005", "004"]);

        let status = engine.status().unwrap();
        assert_eq!(status.current_version.as_deref(), Some("003"));
        assert_eq!(status.executed_versions, vec!["001", "002", "003"]);
        assert!(!index_exists(&pool, "idx_requests_title").unwrap());
        assert!(!index_exists(&pool, "idx_requests_status_created").unwrap());
        assert!(table_exists(&pool, "cache_entries").unwrap());
    }

    #[test]
    fn test_rollback_then_rerun() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let engine = MigrationEngine::new(Arc::clone(&pool), default_units()).unwrap();

        engine.run(None).unwrap();
        let report = engine.rollback_to("000").unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.completed.len(), 10);
        assert!(engine.executed_versions().unwrap().is_empty());
        assert!(!table_exists(&pool, "content_requests").unwrap());

        let report = engine.run(None).unwrap();
        assert_eq!(report.completed.len(), 10);
        assert!(table_exists(&pool, "content_requests").unwrap());
    }

    #[test]
    fn test_run_to_target() {
        let dir = TempDir::new().unwrap();
        let engine = MigrationEngine::new(test_pool(&dir), default_units()).unwrap();

        let report = engine.run(Some("003")).unwrap();
        assert_eq!(report.completed, vec!["001", "002", "003"]);

        let status = engine.status().unwrap();
        assert_eq!(status.pending_count, 7);
        assert_eq!(status.pending_versions.first().map(String::as_str), Some("004"));
    }

    #[test]
    fn test_failing_unit_stops_batch() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let units = vec![
            MigrationUnit::new("003", "Create gamma", create_gamma, noop),
            MigrationUnit::new("001", "Create alpha", create_alpha, drop_alpha),
            MigrationUnit::new("002", "Broken", broken, noop),
        ];
        let engine = MigrationEngine::new(Arc::clone(&pool), units).unwrap();

        let report = engine.run(None).unwrap();
        assert!(!report.is_success());
        assert_eq!(report.planned, vec!["001", "002", "003"]);
        assert_eq!(report.completed, vec!["001"]);
        assert_eq!(report.failed.as_ref().map(|f| f.version.as_str()), Some("002"));

        assert_eq!(engine.executed_versions().unwrap(), vec!["001"]);
        assert!(table_exists(&pool, "alpha").unwrap());
        assert!(!table_exists(&pool, "gamma").unwrap());
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let dir = TempDir::new().unwrap();
        let units = vec![
            MigrationUnit::new("001", "Create alpha", create_alpha, drop_alpha),
            MigrationUnit::new("001", "Create gamma", create_gamma, noop),
        ];
        let result = MigrationEngine::new(test_pool(&dir), units);
        assert!(matches!(result, Err(MigrationError::DuplicateVersion(v)) if v == "001"));
    }

    #[test]
    fn test_rollback_of_unregistered_version_fails() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let both = vec![
            MigrationUnit::new("001", "Create alpha", create_alpha, drop_alpha),
            MigrationUnit::new("002", "Create gamma", create_gamma, noop),
        ];
        MigrationEngine::new(Arc::clone(&pool), both).unwrap().run(None).unwrap();

        let only_first = vec![MigrationUnit::new("001", "Create alpha", create_alpha, drop_alpha)];
        let engine = MigrationEngine::new(pool, only_first).unwrap();
        let report = engine.rollback_to("000").unwrap();

        assert!(report.completed.is_empty());
        assert_eq!(report.failed.as_ref().map(|f| f.version.as_str()), Some("002"));
        assert_eq!(engine.executed_versions().unwrap(), vec!["001", "002"]);
    }

    #[test]
    fn test_info_reports_checksums() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir);
        let engine = MigrationEngine::new(Arc::clone(&pool), first_five()).unwrap();
        engine.run(Some("002")).unwrap();

        pool.execute_query(
            "UPDATE schema_migrations SET checksum = 'tampered' WHERE version = '002'",
            &[],
            FetchMode::Affected,
        )
        .unwrap();

        let info = engine.info().unwrap();
        assert_eq!(info.len(), 5);
        assert_eq!(info[0].checksum_matches, Some(true));
        assert_eq!(info[1].checksum_matches, Some(false));
        assert!(!info[2].executed);
        assert_eq!(info[2].checksum_matches, None);
    }

    #[test]
    fn test_events_are_streamed() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        let units = vec![MigrationUnit::new("001", "Create alpha", create_alpha, drop_alpha)];
        let engine = MigrationEngine::new(test_pool(&dir), units).unwrap().with_events(tx);

        engine.run(None).unwrap();
        drop(engine);

        let events: Vec<MigrationEvent> = rx.iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            MigrationEvent::Planned {
                direction: Direction::Up,
                total: 1
            }
        );
        assert!(matches!(&events[2], MigrationEvent::Finished { version, .. } if version == "001"));
        assert_eq!(
            events[3],
            MigrationEvent::Completed {
                direction: Direction::Up,
                completed: 1
            }
        );
    }
}

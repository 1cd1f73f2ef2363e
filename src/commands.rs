use crate::{emit_failure, emit_success, OutputMode};
use requestkeeper::config::{ensure_db_dir, load_config, StoreConfig};
use requestkeeper::migrate::{
    default_units, Direction, MigrationEngine, MigrationError, MigrationReport,
};
use requestkeeper::storage::StorageGateway;
use requestkeeper::ui::{self, MigrationProgress, Spinner, UnitState};
use requestkeeper::ConnectionPoolManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resolved configuration and the pool every subcommand works through
pub struct Context {
    pub config: StoreConfig,
    pub pool: Arc<ConnectionPoolManager>,
    pub output_mode: OutputMode,
}

impl Context {
    /// Layer the config file, the environment, then `--database`
    pub fn open(
        config_path: Option<&Path>,
        database: Option<PathBuf>,
        output_mode: OutputMode,
    ) -> anyhow::Result<Self> {
        let mut config = load_config(config_path)?.with_process_env()?;
        if let Some(path) = database {
            config.database.path = path;
        }
        ensure_db_dir(&config.database.path)?;
        tracing::debug!("Using database {}", config.database.path.display());

        let pool = Arc::new(ConnectionPoolManager::new(config.pool_config()));
        Ok(Self {
            config,
            pool,
            output_mode,
        })
    }

    fn is_human(&self) -> bool {
        self.output_mode.is_human()
    }

    fn database_label(&self) -> String {
        self.config.database.path.display().to_string()
    }

    fn engine(&self) -> anyhow::Result<MigrationEngine> {
        self.pool.create_pool()?;
        Ok(MigrationEngine::new(Arc::clone(&self.pool), default_units())?)
    }
}

/// Run a batch with a progress bar in human mode
fn run_batch(
    ctx: &Context,
    batch: impl FnOnce(&MigrationEngine) -> Result<MigrationReport, MigrationError>,
) -> anyhow::Result<(MigrationReport, Duration)> {
    let engine = ctx.engine()?;
    let start = Instant::now();

    let report = if ctx.is_human() {
        let (progress, tx) = MigrationProgress::new();
        let engine = engine.with_events(tx);
        let report = batch(&engine);
        // The listener exits once the engine's sender is gone
        drop(engine);
        progress.finish();
        report?
    } else {
        batch(&engine)?
    };

    Ok((report, start.elapsed()))
}

fn describe(version: &str) -> &'static str {
    default_units()
        .iter()
        .find(|unit| unit.version == version)
        .map(|unit| unit.description)
        .unwrap_or("")
}

fn print_report(report: &MigrationReport, elapsed: Duration) {
    if report.is_noop() {
        ui::outcome(true, "Nothing to do, database is up to date");
        return;
    }

    let done = match report.direction {
        Direction::Up => UnitState::Applied,
        Direction::Down => UnitState::Reverted,
    };
    for version in &report.completed {
        ui::migration_line(version, describe(version), done);
    }
    if let Some(failed) = &report.failed {
        ui::migration_line(&failed.version, describe(&failed.version), UnitState::Failed);
        for version in report.planned.iter().skip(report.completed.len() + 1) {
            ui::migration_line(version, describe(version), UnitState::Pending);
        }
        ui::outcome(false, &format!("Migration {} failed: {}", failed.version, failed.error));
        return;
    }

    ui::batch_summary(report.direction, report.completed.len(), elapsed);
}

fn finish_batch(ctx: &Context, command: &str, report: &MigrationReport) -> anyhow::Result<()> {
    if let Some(failed) = &report.failed {
        emit_failure(ctx.output_mode, command, report)?;
        anyhow::bail!("{} stopped at migration {}", command, failed.version);
    }
    emit_success(ctx.output_mode, command, report)
}

pub fn run_setup(ctx: &Context) -> anyhow::Result<()> {
    if ctx.is_human() {
        ui::banner("Database setup", &ctx.database_label());
    }

    let (report, elapsed) = run_batch(ctx, |engine| engine.run(None))?;
    if ctx.is_human() {
        print_report(&report, elapsed);
    }
    if let Some(failed) = &report.failed {
        emit_failure(ctx.output_mode, "setup", &report)?;
        anyhow::bail!("Setup failed at migration {}", failed.version);
    }

    let validation = ctx.engine()?.validate_schema()?;
    if ctx.is_human() {
        println!();
        ui::validation_report(&validation);
    }

    let data = serde_json::json!({
        "migrations": report,
        "validation": validation,
    });
    if !validation.valid {
        emit_failure(ctx.output_mode, "setup", data)?;
        anyhow::bail!("Schema is not valid after setup");
    }
    emit_success(ctx.output_mode, "setup", data)
}

pub fn run_upgrade(ctx: &Context, target: Option<&str>) -> anyhow::Result<()> {
    if ctx.is_human() {
        ui::banner(
            &format!("Upgrading to {}", target.unwrap_or("latest")),
            &ctx.database_label(),
        );
    }

    let (report, elapsed) = run_batch(ctx, |engine| engine.run(target))?;
    if ctx.is_human() {
        print_report(&report, elapsed);
    }
    finish_batch(ctx, "upgrade", &report)
}

pub fn run_rollback(ctx: &Context, target: &str) -> anyhow::Result<()> {
    if ctx.is_human() {
        ui::banner(&format!("Rolling back to {}", target), &ctx.database_label());
    }

    let (report, elapsed) = run_batch(ctx, |engine| engine.rollback_to(target))?;
    if ctx.is_human() {
        print_report(&report, elapsed);
    }
    finish_batch(ctx, "rollback", &report)
}

pub fn run_status(ctx: &Context) -> anyhow::Result<()> {
    let engine = ctx.engine()?;
    let status = engine.status()?;
    let details = engine.info()?;

    if ctx.is_human() {
        ui::banner("Migration status", &ctx.database_label());
        ui::summary_row(
            "current version",
            status.current_version.as_deref().unwrap_or("none"),
        );
        ui::summary_row("total", &status.total_migrations.to_string());
        ui::summary_row("executed", &status.executed_count.to_string());
        ui::summary_row("pending", &status.pending_count.to_string());
        println!();
        println!("{}", ui::migrations_table(&details));
        if details.iter().any(|d| d.checksum_matches == Some(false)) {
            ui::caution("Some applied migrations changed after they ran; see `validate`");
        }
        return Ok(());
    }

    emit_success(
        ctx.output_mode,
        "status",
        serde_json::json!({
            "status": status,
            "migrations": details,
        }),
    )
}

pub fn run_validate(ctx: &Context) -> anyhow::Result<()> {
    let validation = ctx.engine()?.validate_schema()?;

    if ctx.is_human() {
        ui::banner("Schema validation", &ctx.database_label());
        ui::validation_report(&validation);
    }

    if !validation.valid {
        emit_failure(ctx.output_mode, "validate", &validation)?;
        anyhow::bail!("Schema is not valid");
    }
    emit_success(ctx.output_mode, "validate", &validation)
}

pub fn run_health(ctx: &Context) -> anyhow::Result<()> {
    let spinner = ctx.is_human().then(|| Spinner::new("Checking connection pool..."));
    let created = ctx.pool.create_pool();
    let healthy = created.is_ok() && ctx.pool.health_check();
    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }

    let status = ctx.pool.pool_status();
    let performance = ctx.pool.performance_stats();

    if ctx.is_human() {
        ui::banner("Pool health", &ctx.database_label());
        if let Err(e) = &created {
            ui::caution(&format!("Pool could not be created: {}", e));
        }
        ui::health_verdict(healthy);
        println!();
        println!(
            "{}",
            ui::stats_table(&[
                ("Pool", status.pool_name.clone()),
                ("Size", status.pool_size.to_string()),
                ("Connections", status.connections.to_string()),
                ("Idle", status.idle_connections.to_string()),
                ("Created", performance.stats.created_connections.to_string()),
                ("Failed connections", performance.stats.failed_connections.to_string()),
                ("Queries", performance.stats.total_queries.to_string()),
                ("Failed queries", performance.stats.failed_queries.to_string()),
                ("Success rate", format!("{:.2}%", performance.success_rate)),
                ("Pool hit rate", format!("{:.2}%", performance.pool_hit_rate)),
            ])
        );
    }

    let data = serde_json::json!({
        "healthy": healthy,
        "pool": status,
        "performance": performance,
    });
    if !healthy {
        emit_failure(ctx.output_mode, "health", data)?;
        anyhow::bail!("Connection pool is not healthy");
    }
    emit_success(ctx.output_mode, "health", data)
}

pub fn run_stats(ctx: &Context) -> anyhow::Result<()> {
    let pool = ctx.config.database.enabled.then(|| Arc::clone(&ctx.pool));
    let gateway = StorageGateway::new(pool, ctx.config.gateway_config());
    let stats = gateway.system_stats();
    let metrics = gateway.metrics();

    if ctx.is_human() {
        ui::banner("Content statistics", &ctx.database_label());
        ui::summary_row("mode", &gateway.mode().to_string());
        if !gateway.is_database_connected() {
            ui::caution("Store unavailable; figures cover this process only");
        }
        println!();
        println!(
            "{}",
            ui::stats_table(&[
                ("Requests", stats.total_requests.to_string()),
                ("Pending", stats.pending_requests.to_string()),
                ("Fulfilled", stats.fulfilled_requests.to_string()),
                ("Rejected", stats.rejected_requests.to_string()),
                ("Last 24h", stats.requests_last_24h.to_string()),
                ("Fulfillment rate", format!("{:.2}%", stats.fulfillment_rate)),
                ("Users", stats.total_users.to_string()),
                ("Active (7d)", stats.active_users_7d.to_string()),
                ("Banned", stats.banned_users.to_string()),
                ("Ratings", stats.total_ratings.to_string()),
                ("Average rating", format!("{:.2}", stats.average_rating)),
            ])
        );
        println!("  {}", ui::faint(&format!("generated {}", stats.generated_at)));
        return Ok(());
    }

    emit_success(
        ctx.output_mode,
        "stats",
        serde_json::json!({
            "stats": stats,
            "gateway": metrics,
        }),
    )
}

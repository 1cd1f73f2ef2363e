use crate::migrate::{Direction, SchemaValidation};
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Where a unit stands in a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Applied,
    Reverted,
    Pending,
    Failed,
}

/// Command title followed by the database it runs against
pub fn banner(title: &str, database: &str) {
    println!("{} {}", Icons::ROCKET, title.style(theme().title.clone()));
    summary_row("database", database);
    println!();
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {:<18} {}", label.style(theme().label.clone()), value);
}

/// Final line of a command: check mark or cross
pub fn outcome(ok: bool, message: &str) {
    let icon = if ok { Icons::CHECK } else { Icons::CROSS };
    let line = format!("{} {}", icon, message.style(theme().verdict(ok)));
    if ok {
        println!("{}", line);
    } else {
        eprintln!("{}", line);
    }
}

/// Degradation or advisory note, on stderr
pub fn caution(message: &str) {
    eprintln!("{} {}", Icons::WARN, message.style(theme().caution.clone()));
}

pub fn faint(text: &str) -> String {
    text.style(theme().faint.clone()).to_string()
}

pub fn migration_line(version: &str, description: &str, state: UnitState) {
    let (icon, description) = match state {
        UnitState::Applied => (Icons::UP, description.to_string()),
        UnitState::Reverted => (Icons::DOWN, description.to_string()),
        UnitState::Pending => (Icons::PENDING, faint(description)),
        UnitState::Failed => (Icons::CROSS, description.style(theme().bad.clone()).to_string()),
    };
    println!("  {} {} {}", icon, version.style(theme().version.clone()), description);
}

/// "Applied 3 migration(s) in 12ms"
pub fn batch_summary(direction: Direction, completed: usize, elapsed: Duration) {
    let verb = match direction {
        Direction::Up => "Applied",
        Direction::Down => "Reverted",
    };
    outcome(
        true,
        &format!("{} {} migration(s) in {}ms", verb, completed, elapsed.as_millis()),
    );
}

pub fn health_verdict(healthy: bool) {
    let word = if healthy { "healthy" } else { "unhealthy" };
    println!(
        "{} {} {}",
        Icons::HEART,
        "pool".style(theme().label.clone()),
        word.style(theme().verdict(healthy))
    );
}

pub fn validation_report(validation: &SchemaValidation) {
    if !validation.missing_tables.is_empty() {
        summary_row("missing tables", &validation.missing_tables.join(", "));
    }
    if !validation.checksum_mismatches.is_empty() {
        summary_row("changed units", &validation.checksum_mismatches.join(", "));
    }
    for issue in &validation.table_issues {
        caution(issue);
    }
    if !validation.recommendations.is_empty() {
        println!();
        println!("{}", "Recommendations".style(theme().title.clone()));
        for recommendation in &validation.recommendations {
            println!("  - {}", recommendation);
        }
    }
    outcome(
        validation.valid,
        if validation.valid { "Schema valid" } else { "Schema invalid" },
    );
}

pub mod icons;
pub mod output;
pub mod progress;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{
    banner, batch_summary, caution, faint, health_verdict, migration_line, outcome, summary_row,
    validation_report, UnitState,
};
pub use progress::{MigrationProgress, Spinner};
pub use table::{migrations_table, stats_table, TableBuilder};
pub use theme::{theme, Theme};

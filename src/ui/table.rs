use crate::migrate::MigrationDetail;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
struct MigrationRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Applied")]
    applied: String,
    #[tabled(rename = "Took")]
    took: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

impl From<&MigrationDetail> for MigrationRow {
    fn from(detail: &MigrationDetail) -> Self {
        Self {
            version: detail.version.clone(),
            description: detail.description.clone(),
            applied: detail.executed_at.clone().unwrap_or_else(|| "pending".to_string()),
            took: detail
                .execution_time_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_default(),
            checksum: match detail.checksum_matches {
                Some(true) => "ok".to_string(),
                Some(false) => "changed".to_string(),
                None => String::new(),
            },
        }
    }
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, label: &str, value: impl ToString) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }
        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, String)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

pub fn migrations_table(details: &[MigrationDetail]) -> String {
    if details.is_empty() {
        return String::new();
    }
    let rows: Vec<MigrationRow> = details.iter().map(MigrationRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

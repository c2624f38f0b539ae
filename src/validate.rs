//! Schema-validation command (§1, §6 `--validate`): introspects Postgres to
//! check that every configured collection's destination table exists, has
//! every configured column, and has a unique index on its `_id` column.
//!
//! Out of scope per §1 as an algorithm to design, but §6 requires the flag
//! be supported, so this is a direct, faithful port of the original's
//! `ValidateTablesAndColumns` / `GetTableColumnIndexMetadata` queries.

use deadpool_postgres::Pool;

use crate::config::Config;
use crate::error::Result;

const COLUMNS_SQL: &str = "SELECT column_name FROM information_schema.columns WHERE table_schema = 'public' AND table_name = $1";

const UNIQUE_INDEX_SQL: &str = r#"
SELECT i.relname AS index_name
FROM pg_class t
JOIN pg_index ix ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
WHERE t.relname = $1 AND ix.indisunique = true
"#;

/// One collection's validation outcome: what, if anything, is wrong with its
/// destination table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    pub pg_table: String,
    pub table_missing: bool,
    pub missing_columns: Vec<String>,
    pub missing_unique_index: bool,
}

impl TableReport {
    pub fn is_ok(&self) -> bool {
        !self.table_missing && self.missing_columns.is_empty() && !self.missing_unique_index
    }
}

/// Introspect Postgres for every collection in `config`, returning one
/// [`TableReport`] per collection, ordered the same way the config iterates
/// (database, then collection name).
pub async fn run(pool: &Pool, config: &Config) -> Result<Vec<TableReport>> {
    let client = pool.get().await.map_err(crate::error::MoresqlError::PostgresPool)?;
    let mut reports = Vec::new();

    for db in config.values() {
        for collection in db.collections.values() {
            let rows = client.query(COLUMNS_SQL, &[&collection.pg_table]).await?;
            let existing_columns: std::collections::HashSet<String> =
                rows.iter().map(|row| row.get::<_, String>("column_name")).collect();

            let table_missing = existing_columns.is_empty();

            let missing_columns: Vec<String> = collection
                .fields
                .values()
                .map(|field| field.postgres.name.clone())
                .filter(|name| !existing_columns.contains(name))
                .collect();

            let index_rows = client.query(UNIQUE_INDEX_SQL, &[&collection.pg_table]).await?;
            let missing_unique_index = index_rows.is_empty();

            reports.push(TableReport {
                pg_table: collection.pg_table.clone(),
                table_missing,
                missing_columns: if table_missing { Vec::new() } else { missing_columns },
                missing_unique_index,
            });
        }
    }

    Ok(reports)
}

/// Render a human-readable summary of validation reports, matching the
/// original's remediation-oriented CLI output: one line per problem found,
/// nothing printed for tables that validate cleanly.
pub fn format_report(reports: &[TableReport]) -> String {
    let mut lines = Vec::new();
    for report in reports {
        if report.is_ok() {
            continue;
        }
        if report.table_missing {
            lines.push(format!("table \"{}\": missing; run --create-table-sql or create it manually", report.pg_table));
            continue;
        }
        if !report.missing_columns.is_empty() {
            lines.push(format!(
                "table \"{}\": missing columns: {}",
                report.pg_table,
                report.missing_columns.join(", ")
            ));
        }
        if report.missing_unique_index {
            lines.push(format!("table \"{}\": missing a unique index", report.pg_table));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_report_formats_to_empty_string() {
        let report = TableReport {
            pg_table: "widgets".into(),
            table_missing: false,
            missing_columns: Vec::new(),
            missing_unique_index: false,
        };
        assert!(report.is_ok());
        assert_eq!(format_report(&[report]), "");
    }

    #[test]
    fn missing_table_reports_table_missing() {
        let report = TableReport {
            pg_table: "widgets".into(),
            table_missing: true,
            missing_columns: Vec::new(),
            missing_unique_index: true,
        };
        assert!(!report.is_ok());
        let text = format_report(&[report]);
        assert!(text.contains("missing; run --create-table-sql"));
    }

    #[test]
    fn missing_columns_are_listed() {
        let report = TableReport {
            pg_table: "widgets".into(),
            table_missing: false,
            missing_columns: vec!["bio".to_string()],
            missing_unique_index: false,
        };
        let text = format_report(&[report]);
        assert!(text.contains("missing columns: bio"));
    }
}

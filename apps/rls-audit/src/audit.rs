//! Finding tables that are not protected by row-level security.

use serde::Serialize;
use sqlx::PgConnection;

/// One row of `pg_tables` for the audited schema.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TableInfo {
    #[sqlx(rename = "tablename")]
    pub name: String,
    #[sqlx(rename = "rowsecurity")]
    pub row_security: bool,
}

/// Outcome of auditing one schema.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub schema: String,
    pub tables_scanned: usize,
    pub ignored: Vec<String>,
    pub unprotected: Vec<String>,
}

impl AuditReport {
    pub fn new(schema: &str, tables: &[TableInfo], ignored: Vec<String>) -> Self {
        Self {
            schema: schema.to_owned(),
            tables_scanned: tables.len(),
            unprotected: unprotected_tables(tables, &ignored),
            ignored,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.unprotected.is_empty()
    }
}

/// Parse the comma separated ignore list. Blank entries are dropped.
pub fn parse_ignored(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Names of tables without row-level security that are not ignored.
pub fn unprotected_tables(tables: &[TableInfo], ignored: &[String]) -> Vec<String> {
    tables
        .iter()
        .filter(|table| !table.row_security)
        .filter(|table| !ignored.iter().any(|name| *name == table.name))
        .map(|table| table.name.clone())
        .collect()
}

/// List the tables of `schema` with their row-level-security flag.
pub async fn fetch_tables(conn: &mut PgConnection, schema: &str) -> Result<Vec<TableInfo>, sqlx::Error> {
    sqlx::query_as::<_, TableInfo>(
        "SELECT tablename, rowsecurity FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
    )
    .bind(schema)
    .fetch_all(conn)
    .await
}

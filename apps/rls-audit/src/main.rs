#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Row-level-security audit for a Postgres schema.
//!
//! Lists the tables of a schema and reports every table that does not have
//! row-level security enabled. Internal tables (migration bookkeeping and the
//! like) can be excluded with `--ignored-tables`.
//!
//! # Usage
//!
//! ```bash
//! rls-audit --host db --user postgres --password secret --schema public
//!
//! # Ignore bookkeeping tables, JSON output
//! rls-audit --dsn postgres://postgres:secret@db/app --ignored-tables schema_migrations --json
//! ```

// CLI tools are expected to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod audit;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use tracing_subscriber::EnvFilter;

use crate::audit::{AuditReport, fetch_tables, parse_ignored};

/// Reports tables that don't implement Row Level Security.
#[derive(Parser, Debug)]
#[command(name = "rls-audit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Postgres host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Postgres port
    #[arg(long, default_value_t = 5432)]
    port: u16,

    /// Postgres user
    #[arg(long, default_value = "postgres")]
    user: String,

    /// Postgres password
    #[arg(long, default_value = "postgres")]
    password: String,

    /// Postgres database
    #[arg(long, default_value = "postgres")]
    database: String,

    /// Postgres sslmode (disable, allow, prefer, require, verify-ca, verify-full)
    #[arg(long, default_value = "disable")]
    sslmode: String,

    /// Connection string; overrides the individual connection flags
    #[arg(long)]
    dsn: Option<String>,

    /// Schema to scan for RLS
    #[arg(long, default_value = "public")]
    schema: String,

    /// Comma separated list of tables to ignore (e.g. migration tracking tables)
    #[arg(long, default_value = "")]
    ignored_tables: String,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Log connection and scan progress to stderr
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Cli {
    fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(dsn) = &self.dsn {
            return dsn
                .parse()
                .with_context(|| format!("invalid --dsn {}", tenancy_db::redact_credentials_in_dsn(Some(dsn))));
        }
        let ssl_mode: PgSslMode = self
            .sslmode
            .parse()
            .with_context(|| format!("invalid --sslmode {}", self.sslmode))?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode))
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "rls_audit=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: &Cli) -> anyhow::Result<AuditReport> {
    let opts = cli.connect_options()?;
    tracing::debug!(
        host = opts.get_host(),
        port = opts.get_port(),
        database = opts.get_database().unwrap_or(""),
        "connecting"
    );
    let mut conn = PgConnection::connect_with(&opts)
        .await
        .context("failed to connect to postgres")?;

    let tables = fetch_tables(&mut conn, &cli.schema)
        .await
        .with_context(|| format!("failed to list tables of schema {}", cli.schema))?;
    tracing::debug!(schema = %cli.schema, tables = tables.len(), "scanned schema");

    if let Err(err) = conn.close().await {
        tracing::warn!(error = %err, "failed to close audit connection");
    }
    Ok(AuditReport::new(&cli.schema, &tables, parse_ignored(&cli.ignored_tables)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let report = match run(&cli).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        print_json(&report);
    } else {
        print_human(&report);
    }

    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json(report: &AuditReport) {
    let output = serde_json::json!({
        "ok": report.is_ok(),
        "report": report,
    });
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to serialize report: {err}"),
    }
}

fn print_human(report: &AuditReport) {
    if report.is_ok() {
        println!("{}", "all tables are implementing Row Level Security".green());
    } else {
        println!(
            "{}",
            format!(
                "found the following tables that don't implement Row Level Security: {}",
                report.unprotected.join(", ")
            )
            .red()
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn discrete_flags_build_connect_options() {
        let cli = Cli::parse_from([
            "rls-audit",
            "--host",
            "db.internal",
            "--port",
            "6543",
            "--database",
            "app",
            "--sslmode",
            "require",
        ]);
        let opts = cli.connect_options().unwrap();
        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_database(), Some("app"));
        assert_eq!(opts.get_username(), "postgres");
    }

    #[test]
    fn dsn_overrides_discrete_flags() {
        let cli = Cli::parse_from([
            "rls-audit",
            "--host",
            "ignored",
            "--dsn",
            "postgres://auditor:pw@warehouse:5433/reports",
        ]);
        let opts = cli.connect_options().unwrap();
        assert_eq!(opts.get_host(), "warehouse");
        assert_eq!(opts.get_port(), 5433);
        assert_eq!(opts.get_username(), "auditor");
    }

    #[test]
    fn rejects_unknown_sslmode() {
        let cli = Cli::parse_from(["rls-audit", "--sslmode", "sometimes"]);
        assert!(cli.connect_options().is_err());
    }

    #[test]
    fn defaults_match_local_postgres() {
        let cli = Cli::parse_from(["rls-audit"]);
        assert_eq!(cli.schema, "public");
        assert_eq!(cli.port, 5432);
        assert!(cli.ignored_tables.is_empty());
        assert!(!cli.json);
    }
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant-scoped database access for Postgres row-level security.
//!
//! A [`TenantPool`] hands out connections that are *tagged* with a tenant id
//! before any application statement runs on them, and *untagged* before they
//! go back to the driver pool. Row-level-security policies in the database
//! read the tag, so every statement issued through the pool only sees that
//! tenant's rows.
//!
//! The pool travels through the call chain inside a [`Scope`]. Code deep in a
//! request reaches it with [`current_pool`] instead of threading it through
//! every signature, and functions that must only run under RLS take
//! `impl TenantExecutor`, which raw driver connections do not implement.
//!
//! # Features
//! - `pg` (default): the `PostgreSQL` binding ([`PgSource`]) over `sqlx`
//! - `testing`: an in-memory driver with fault injection
//!
//! # Example
//! ```rust,no_run
//! use sqlx::postgres::PgArguments;
//! use tenancy_db::{PgSource, PoolCfg, PoolOptions, Scope, TenantExecutor, TenantPool};
//!
//! # async fn demo() -> tenancy_db::Result<()> {
//! let source = PgSource::connect("postgres://tenant@localhost/app", &PoolCfg::default()).await?;
//! let (pool, scope) = TenantPool::open(
//!     &Scope::background(),
//!     source,
//!     "tenant-a",
//!     PoolOptions::new(),
//! )?;
//!
//! let rows = pool.query_in(&scope, "SELECT id FROM users", PgArguments::default()).await?;
//! println!("tenant-a sees {} users", rows.len());
//!
//! pool.close(&scope).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(feature = "pg"),
    allow(unused_imports, dead_code, clippy::unused_async)
)]

pub mod config;
pub mod driver;
pub mod error;
pub mod handle;
pub mod pool;
#[cfg(feature = "pg")]
pub mod postgres;
pub mod protocol;
pub mod scope;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tx_config;

mod pool_opts;
mod tenant_id;

pub use config::{PoolCfg, TenancyConfig, redact_credentials_in_dsn};
pub use driver::{ArgumentsOf, ConnectionSource, DoneOf, RawConnection, RowOf};
pub use error::{CleanupFailure, CleanupStage, CloseError, Result, TenancyError};
pub use handle::{ConnGuard, TenantConn, TenantExecutor, TenantScoped, TenantTx};
pub use pool::{PoolOption, PoolOptions, TenantPool, close, open};
#[cfg(feature = "pg")]
pub use postgres::{PgConn, PgSource};
pub use protocol::{DEFAULT_TAG_STATEMENT, DEFAULT_UNTAG_STATEMENT, TaggingProtocol};
pub use scope::{Scope, current_pool, current_tenant_id};
pub use tenant_id::TenantId;
pub use tx_config::{TxAccessMode, TxConfig, TxIsolationLevel};

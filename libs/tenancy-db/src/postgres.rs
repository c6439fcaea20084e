//! `PostgreSQL` driver binding over `sqlx::PgPool`.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::Postgres;

use crate::config::PoolCfg;
use crate::driver::{ConnectionSource, RawConnection};
use crate::pool_opts::ApplyPoolOpts;
use crate::{Result, TenancyError, TxConfig};

/// Raw Postgres connection as handed out by the driver pool.
pub type PgConn = PoolConnection<Postgres>;

/// Connection source backed by a shared `sqlx` Postgres pool.
#[derive(Debug, Clone)]
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new driver pool to `dsn` with `cfg` applied.
    ///
    /// # Errors
    /// `Acquire` if the first connection cannot be established.
    pub async fn connect(dsn: &str, cfg: &PoolCfg) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .apply(cfg)
            .connect(dsn)
            .await
            .map_err(TenancyError::Acquire)?;
        Ok(Self { pool })
    }

    /// Build a driver pool that connects on first use.
    ///
    /// # Errors
    /// `InvalidConfig` if `dsn` cannot be parsed.
    pub fn connect_lazy(dsn: &str, cfg: &PoolCfg) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .apply(cfg)
            .connect_lazy(dsn)
            .map_err(|e| TenancyError::InvalidConfig(format!("invalid postgres dsn: {e}")))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl From<PgPool> for PgSource {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}

#[async_trait]
impl ConnectionSource for PgSource {
    type Conn = PgConn;

    async fn acquire(&self) -> std::result::Result<PgConn, sqlx::Error> {
        self.pool.acquire().await
    }
}

#[async_trait]
impl RawConnection for PgConn {
    type Row = PgRow;
    type Arguments = PgArguments;
    type Done = PgQueryResult;

    async fn session_statement(
        &mut self,
        sql: &str,
        param: Option<&str>,
    ) -> std::result::Result<(), sqlx::Error> {
        match param {
            Some(param) => sqlx::query(sql).bind(param).execute(&mut **self).await?,
            None => sqlx::Executor::execute(&mut **self, sqlx::raw_sql(sql)).await?,
        };
        Ok(())
    }

    async fn execute(
        &mut self,
        sql: &str,
        args: PgArguments,
    ) -> std::result::Result<PgQueryResult, sqlx::Error> {
        sqlx::query_with(sql, args).execute(&mut **self).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        args: PgArguments,
    ) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
        sqlx::query_with(sql, args).fetch_all(&mut **self).await
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        args: PgArguments,
    ) -> std::result::Result<Option<PgRow>, sqlx::Error> {
        sqlx::query_with(sql, args).fetch_optional(&mut **self).await
    }

    async fn begin(&mut self, cfg: &TxConfig) -> std::result::Result<(), sqlx::Error> {
        let stmt = cfg.begin_statement();
        sqlx::Executor::execute(&mut **self, sqlx::raw_sql(&stmt)).await?;
        Ok(())
    }

    async fn commit(&mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::Executor::execute(&mut **self, sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::Executor::execute(&mut **self, sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }

    fn release(self) {
        drop(self);
    }

    async fn close(self) -> std::result::Result<(), sqlx::Error> {
        PoolConnection::close(self).await
    }

    fn discard(self) {
        drop(self.detach());
    }
}

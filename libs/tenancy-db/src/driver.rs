//! Seam between tenant pools and the underlying driver pool.
//!
//! A tenant pool needs very little from the driver: hand out a connection,
//! run statements on it, and take it back (for reuse, or destroyed). The
//! `PostgreSQL` binding lives in [`crate::postgres`]; an in-memory driver with
//! fault injection lives in `crate::testing` (feature `testing`).

use async_trait::async_trait;

use crate::TxConfig;

/// Row type produced by a raw connection.
pub type RowOf<C> = <C as RawConnection>::Row;
/// Bind-argument type accepted by a raw connection.
pub type ArgumentsOf<C> = <C as RawConnection>::Arguments;
/// Result type of a non-query statement on a raw connection.
pub type DoneOf<C> = <C as RawConnection>::Done;

/// Handle to the driver pool that supplies physical connections.
///
/// Implementations are cheap to clone and share one underlying pool.
#[async_trait]
pub trait ConnectionSource: Clone + Send + Sync + 'static {
    type Conn: RawConnection;

    /// Acquire one physical connection. May wait for the driver pool.
    async fn acquire(&self) -> Result<Self::Conn, sqlx::Error>;
}

/// One physical connection checked out of the driver pool.
#[async_trait]
pub trait RawConnection: Send + 'static {
    type Row: Send + 'static;
    type Arguments: Send + 'static;
    type Done: Send + 'static;

    /// Run a session-state statement with at most one text parameter.
    ///
    /// Used by the tagging protocol for the tag and untag statements.
    async fn session_statement(&mut self, sql: &str, param: Option<&str>)
    -> Result<(), sqlx::Error>;

    async fn execute(&mut self, sql: &str, args: Self::Arguments)
    -> Result<Self::Done, sqlx::Error>;

    async fn fetch_all(
        &mut self,
        sql: &str,
        args: Self::Arguments,
    ) -> Result<Vec<Self::Row>, sqlx::Error>;

    async fn fetch_optional(
        &mut self,
        sql: &str,
        args: Self::Arguments,
    ) -> Result<Option<Self::Row>, sqlx::Error>;

    async fn begin(&mut self, cfg: &TxConfig) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    /// Give the connection back to the driver pool for reuse.
    ///
    /// Only called once the tenant tag has been cleared.
    fn release(self);

    /// Close the physical connection so the driver pool never reuses it.
    async fn close(self) -> Result<(), sqlx::Error>;

    /// Drop the connection without reuse and without waiting on I/O.
    ///
    /// Last resort when a tagged connection is dropped before it could be
    /// untagged.
    fn discard(self);
}

//! Tenant-scoped handles: connections, transactions and the sealed marker.
//!
//! Application code that must only ever run under row-level security asks for
//! `impl TenantExecutor` (or `&TenantTx<_>`) in its signatures. Only the types
//! in this crate implement [`TenantScoped`], so a raw driver connection can
//! never be passed where a tagged one is required.
//!
//! ```ignore
//! async fn list_users(db: &impl TenantExecutor<Conn = PgConn>) -> tenancy_db::Result<Vec<PgRow>> {
//!     db.query("SELECT id, tenant_id FROM users", PgArguments::default()).await
//! }
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::driver::{ArgumentsOf, DoneOf, RawConnection, RowOf};
use crate::{Result, Scope, TenancyError, TenantId, TxConfig};

pub(crate) mod private {
    pub trait Sealed {}
}

/// Capability marker: the handle runs every statement on a tagged session.
///
/// Sealed. It has no methods and cannot be implemented outside this crate.
pub trait TenantScoped: private::Sealed {}

/// Statement passthrough available on every tenant-scoped handle.
///
/// The plain forms run without a deadline; the `_in` forms honour the
/// deadline and cancellation of the given [`Scope`].
#[async_trait]
pub trait TenantExecutor: TenantScoped + Send + Sync {
    type Conn: RawConnection;

    fn tenant_id(&self) -> &TenantId;

    /// # Errors
    /// Checkout/tag failures, statement failures, scope expiry.
    async fn execute_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<Self::Conn>,
    ) -> Result<DoneOf<Self::Conn>>;

    /// # Errors
    /// Checkout/tag failures, statement failures, scope expiry.
    async fn query_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<Self::Conn>,
    ) -> Result<Vec<RowOf<Self::Conn>>>;

    /// Fetch exactly one row; no rows is `Statement(sqlx::Error::RowNotFound)`.
    ///
    /// # Errors
    /// Checkout/tag failures, statement failures, scope expiry.
    async fn query_row_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<Self::Conn>,
    ) -> Result<RowOf<Self::Conn>>;

    /// # Errors
    /// Checkout/tag failures or statement failures.
    async fn execute(&self, sql: &str, args: ArgumentsOf<Self::Conn>) -> Result<DoneOf<Self::Conn>> {
        self.execute_in(&Scope::background(), sql, args).await
    }

    /// # Errors
    /// Checkout/tag failures or statement failures.
    async fn query(&self, sql: &str, args: ArgumentsOf<Self::Conn>) -> Result<Vec<RowOf<Self::Conn>>> {
        self.query_in(&Scope::background(), sql, args).await
    }

    /// # Errors
    /// Checkout/tag failures, statement failures, or no row.
    async fn query_row(&self, sql: &str, args: ArgumentsOf<Self::Conn>) -> Result<RowOf<Self::Conn>> {
        self.query_row_in(&Scope::background(), sql, args).await
    }
}

/// Slot holding one connection from acquisition until its tag is cleared.
///
/// `conn` becomes `None` once the owning pool has untagged and released it.
/// Dropping a slot that still holds a connection discards it, so a tag in an
/// unknown state never reaches the driver pool.
pub(crate) struct SlotState<C: RawConnection> {
    conn: Option<C>,
    rollback_pending: bool,
}

impl<C: RawConnection> SlotState<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            conn: Some(conn),
            rollback_pending: false,
        }
    }

    pub(crate) fn raw(&mut self) -> Result<&mut C> {
        self.conn.as_mut().ok_or(TenancyError::ConnectionReleased)
    }

    pub(crate) fn rollback_pending(&self) -> bool {
        self.rollback_pending
    }

    /// Hand the connection out of the slot once it is safe to leave it.
    pub(crate) fn take(&mut self) -> Option<C> {
        self.rollback_pending = false;
        self.conn.take()
    }
}

impl<C: RawConnection> Drop for SlotState<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("connection dropped before its tenant tag was cleared; discarding it");
            conn.discard();
        }
    }
}

type Slot<C> = Arc<Mutex<SlotState<C>>>;

/// Lock a slot, finishing any rollback left behind by a dropped transaction.
async fn lock_slot<C: RawConnection>(slot: &Slot<C>) -> Result<OwnedMutexGuard<SlotState<C>>> {
    let mut state = Arc::clone(slot).lock_owned().await;
    if state.rollback_pending {
        tracing::debug!("rolling back transaction left open by a dropped handle");
        state.raw()?.rollback().await?;
        state.rollback_pending = false;
    }
    if state.conn.is_none() {
        return Err(TenancyError::ConnectionReleased);
    }
    Ok(state)
}

/// Exclusive access to the raw connection behind a [`TenantConn`].
///
/// Dereferences to the driver connection, so native driver calls work:
/// `sqlx::query("...").fetch_all(&mut **guard)`.
pub struct ConnGuard<C: RawConnection> {
    inner: OwnedMappedMutexGuard<SlotState<C>, C>,
}

impl<C: RawConnection> Deref for ConnGuard<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: RawConnection> DerefMut for ConnGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

/// A tagged connection tracked by a tenant pool.
///
/// Cloning shares the same physical connection; statements from clones are
/// serialized.
pub struct TenantConn<C: RawConnection> {
    id: u64,
    tenant_id: TenantId,
    slot: Slot<C>,
}

impl<C: RawConnection> Clone for TenantConn<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C: RawConnection> fmt::Debug for TenantConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConn")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl<C: RawConnection> TenantConn<C> {
    pub(crate) fn new(id: u64, tenant_id: TenantId, state: SlotState<C>) -> Self {
        Self {
            id,
            tenant_id,
            slot: Arc::new(Mutex::new(state)),
        }
    }

    /// Pool-local number of the physical connection behind this handle.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether both handles share one physical connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Wait for exclusive use of the raw connection.
    ///
    /// # Errors
    /// `ConnectionReleased` once the owning pool has been closed, or the
    /// failure of a pending rollback.
    pub async fn lock(&self) -> Result<ConnGuard<C>> {
        let state = lock_slot(&self.slot).await?;
        OwnedMutexGuard::try_map(state, |state| state.conn.as_mut())
            .map(|inner| ConnGuard { inner })
            .map_err(|_state| TenancyError::ConnectionReleased)
    }

    /// Start a transaction on this (already tagged) connection.
    ///
    /// # Errors
    /// `ConnectionReleased`, the `BEGIN` failure, or scope expiry.
    pub async fn begin_tx(&self, scope: &Scope, cfg: &TxConfig) -> Result<TenantTx<C>> {
        TenantTx::begin(self, scope, cfg).await
    }

    /// Lock the slot under `scope` for cleanup by the owning pool.
    pub(crate) async fn lock_for_cleanup(&self, scope: &Scope) -> Result<OwnedMutexGuard<SlotState<C>>> {
        scope
            .run(async { Ok(Arc::clone(&self.slot).lock_owned().await) })
            .await
    }
}

impl<C: RawConnection> private::Sealed for TenantConn<C> {}
impl<C: RawConnection> TenantScoped for TenantConn<C> {}

#[async_trait]
impl<C: RawConnection> TenantExecutor for TenantConn<C> {
    type Conn = C;

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    async fn execute_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<DoneOf<C>> {
        scope
            .run(async {
                let mut state = lock_slot(&self.slot).await?;
                Ok(state.raw()?.execute(sql, args).await?)
            })
            .await
    }

    async fn query_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<Vec<RowOf<C>>> {
        scope
            .run(async {
                let mut state = lock_slot(&self.slot).await?;
                Ok(state.raw()?.fetch_all(sql, args).await?)
            })
            .await
    }

    async fn query_row_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<RowOf<C>> {
        scope
            .run(async {
                let mut state = lock_slot(&self.slot).await?;
                state
                    .raw()?
                    .fetch_optional(sql, args)
                    .await?
                    .ok_or(TenancyError::Statement(sqlx::Error::RowNotFound))
            })
            .await
    }
}

/// A transaction on a tagged connection.
///
/// Holds the connection exclusively until `commit` or `rollback`. If dropped
/// unfinished, a rollback is queued and runs before the connection is used,
/// untagged or released again.
pub struct TenantTx<C: RawConnection> {
    id: u64,
    tenant_id: TenantId,
    state: Mutex<Option<OwnedMutexGuard<SlotState<C>>>>,
}

impl<C: RawConnection> TenantTx<C> {
    async fn begin(conn: &TenantConn<C>, scope: &Scope, cfg: &TxConfig) -> Result<Self> {
        let mut state = scope.run(lock_slot(&conn.slot)).await?;
        let started = scope
            .run(async { Ok(state.raw()?.begin(cfg).await?) })
            .await;
        if let Err(err) = started {
            // BEGIN may have reached the server before the failure.
            state.rollback_pending = true;
            return Err(err);
        }
        tracing::debug!(tenant_id = %conn.tenant_id, connection = conn.id, "transaction started");
        Ok(Self {
            id: conn.id,
            tenant_id: conn.tenant_id.clone(),
            state: Mutex::new(Some(state)),
        })
    }

    /// Pool-local number of the connection this transaction runs on.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// # Errors
    /// The `COMMIT` failure; the connection is then rolled back before reuse.
    pub async fn commit(mut self) -> Result<()> {
        self.finish(true).await
    }

    /// # Errors
    /// The `ROLLBACK` failure; the rollback is then retried before reuse.
    pub async fn rollback(mut self) -> Result<()> {
        self.finish(false).await
    }

    async fn finish(&mut self, commit: bool) -> Result<()> {
        let Some(mut state) = self.state.get_mut().take() else {
            return Err(TenancyError::ConnectionReleased);
        };
        let conn = state.raw()?;
        let res = if commit {
            conn.commit().await
        } else {
            conn.rollback().await
        };
        if res.is_err() {
            state.rollback_pending = true;
        }
        tracing::debug!(
            tenant_id = %self.tenant_id,
            connection = self.id,
            commit,
            ok = res.is_ok(),
            "transaction finished"
        );
        res.map_err(TenancyError::from)
    }
}

impl<C: RawConnection> Drop for TenantTx<C> {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().as_mut() {
            tracing::debug!(
                tenant_id = %self.tenant_id,
                connection = self.id,
                "transaction dropped unfinished; rollback queued"
            );
            state.rollback_pending = true;
        }
    }
}

impl<C: RawConnection> fmt::Debug for TenantTx<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantTx")
            .field("connection", &self.id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl<C: RawConnection> private::Sealed for TenantTx<C> {}
impl<C: RawConnection> TenantScoped for TenantTx<C> {}

/// Raw connection held by an unfinished transaction.
fn tx_raw<C: RawConnection>(state: &mut Option<OwnedMutexGuard<SlotState<C>>>) -> Result<&mut C> {
    state
        .as_mut()
        .ok_or(TenancyError::ConnectionReleased)?
        .raw()
}

#[async_trait]
impl<C: RawConnection> TenantExecutor for TenantTx<C> {
    type Conn = C;

    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    async fn execute_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<DoneOf<C>> {
        scope
            .run(async {
                let mut state = self.state.lock().await;
                Ok(tx_raw(&mut state)?.execute(sql, args).await?)
            })
            .await
    }

    async fn query_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<Vec<RowOf<C>>> {
        scope
            .run(async {
                let mut state = self.state.lock().await;
                Ok(tx_raw(&mut state)?.fetch_all(sql, args).await?)
            })
            .await
    }

    async fn query_row_in(&self, scope: &Scope, sql: &str, args: ArgumentsOf<C>) -> Result<RowOf<C>> {
        scope
            .run(async {
                let mut state = self.state.lock().await;
                tx_raw(&mut state)?
                    .fetch_optional(sql, args)
                    .await?
                    .ok_or(TenancyError::Statement(sqlx::Error::RowNotFound))
            })
            .await
    }
}

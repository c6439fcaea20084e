//! Tenant pool: tagged connections for one tenant, released together on close.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::driver::{ArgumentsOf, ConnectionSource, DoneOf, RawConnection, RowOf};
use crate::error::{CleanupStage, CloseError};
use crate::handle::{SlotState, TenantConn, TenantExecutor, TenantScoped, TenantTx};
use crate::{Result, Scope, TaggingProtocol, TenancyError, TenantId, TxConfig};

/// Single pool option, parseable from configuration strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOption {
    /// Reuse one checked-out connection for the lifetime of the pool.
    SingleConnection,
}

impl FromStr for PoolOption {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "single-connection" | "single_connection" => Ok(PoolOption::SingleConnection),
            other => Err(TenancyError::InvalidOption(format!(
                "unknown pool option `{other}`"
            ))),
        }
    }
}

/// Options recognised by [`TenantPool::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOptions {
    single_connection: bool,
    protocol: TaggingProtocol,
}

impl PoolOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse exactly one connection instead of a fresh one per checkout.
    ///
    /// Statements from concurrent callers take turns on that connection. An
    /// open [`TenantTx`] holds it until commit or rollback, so running a
    /// statement through the pool from the task that owns the transaction
    /// waits for a transaction that can never finish; use the transaction
    /// handle instead.
    #[must_use]
    pub fn single_connection(mut self) -> Self {
        self.single_connection = true;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: TaggingProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_option(mut self, option: PoolOption) -> Self {
        match option {
            PoolOption::SingleConnection => self.single_connection = true,
        }
        self
    }

    /// Build options from names such as `"single-connection"`.
    ///
    /// # Errors
    /// `InvalidOption` for an unknown name.
    pub fn parse<I>(names: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Self::default(), |opts, name| {
                Ok(opts.with_option(name.as_ref().parse()?))
            })
    }

    #[must_use]
    pub fn is_single_connection(&self) -> bool {
        self.single_connection
    }

    #[must_use]
    pub fn protocol(&self) -> &TaggingProtocol {
        &self.protocol
    }
}

struct Tracked<C: RawConnection> {
    conns: Vec<TenantConn<C>>,
    closed: bool,
}

struct PoolInner<S: ConnectionSource> {
    source: S,
    tenant_id: TenantId,
    options: PoolOptions,
    next_id: AtomicU64,
    // Every mutation of the tracked set, and the single-connection
    // check-then-create, happens under this lock.
    tracked: Mutex<Tracked<S::Conn>>,
}

/// Tagged connections checked out on behalf of one tenant.
///
/// Opening is pure bookkeeping; connections are acquired and tagged on first
/// use. Every connection the pool hands out stays tracked until
/// [`TenantPool::close`] untags and releases it. Clones share the pool.
pub struct TenantPool<S: ConnectionSource> {
    inner: Arc<PoolInner<S>>,
}

impl<S: ConnectionSource> Clone for TenantPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ConnectionSource> fmt::Debug for TenantPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPool")
            .field("tenant_id", &self.inner.tenant_id)
            .field("single_connection", &self.inner.options.single_connection)
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> TenantPool<S> {
    /// Create a pool for `tenant_id` and a child of `parent` carrying it.
    ///
    /// No connection is opened here.
    ///
    /// # Errors
    /// `InvalidOption` if the tagging protocol in `options` is unusable.
    pub fn open(
        parent: &Scope,
        source: S,
        tenant_id: impl Into<TenantId>,
        options: PoolOptions,
    ) -> Result<(Self, Scope)> {
        options.protocol.validate()?;
        let tenant_id = tenant_id.into();
        tracing::debug!(
            tenant_id = %tenant_id,
            single_connection = options.single_connection,
            "tenant pool opened"
        );
        let pool = Self {
            inner: Arc::new(PoolInner {
                source,
                tenant_id,
                options,
                next_id: AtomicU64::new(0),
                tracked: Mutex::new(Tracked {
                    conns: Vec::new(),
                    closed: false,
                }),
            }),
        };
        let scope = parent.with_tenant_pool(pool.clone());
        Ok((pool, scope))
    }

    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    #[must_use]
    pub fn is_single_connection(&self) -> bool {
        self.inner.options.single_connection
    }

    /// Number of connections currently tracked.
    pub async fn tracked_len(&self) -> usize {
        self.inner.tracked.lock().await.conns.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.tracked.lock().await.closed
    }

    /// Get a tagged connection: the shared one in single-connection mode,
    /// otherwise a freshly acquired and tagged one.
    ///
    /// # Errors
    /// `PoolClosed`, `Acquire`, `Tag` (the connection was closed and not
    /// tracked), or scope expiry.
    pub async fn checkout(&self, scope: &Scope) -> Result<TenantConn<S::Conn>> {
        if self.inner.options.single_connection {
            let mut tracked = scope.run(async { Ok(self.inner.tracked.lock().await) }).await?;
            if tracked.closed {
                return Err(TenancyError::PoolClosed(self.inner.tenant_id.clone()));
            }
            if let Some(conn) = tracked.conns.first() {
                tracing::trace!(
                    tenant_id = %self.inner.tenant_id,
                    connection = conn.id(),
                    "reusing single tenant connection"
                );
                return Ok(conn.clone());
            }
            let conn = self.acquire_tagged(scope).await?;
            tracked.conns.push(conn.clone());
            return Ok(conn);
        }

        if self.is_closed().await {
            return Err(TenancyError::PoolClosed(self.inner.tenant_id.clone()));
        }
        let conn = self.acquire_tagged(scope).await?;
        let mut tracked = self.inner.tracked.lock().await;
        if tracked.closed {
            drop(tracked);
            // Closed while we were tagging: clean up here, nobody else will.
            let mut errors = CloseError::new(self.inner.tenant_id.clone());
            self.release_conn(&conn, &Scope::background(), &mut errors).await;
            if let Err(err) = errors.into_result() {
                tracing::warn!(tenant_id = %self.inner.tenant_id, error = %err, "late connection cleanup failed");
            }
            return Err(TenancyError::PoolClosed(self.inner.tenant_id.clone()));
        }
        tracked.conns.push(conn.clone());
        Ok(conn)
    }

    async fn acquire_tagged(&self, scope: &Scope) -> Result<TenantConn<S::Conn>> {
        let tenant_id = &self.inner.tenant_id;
        let raw = scope
            .run(async { self.inner.source.acquire().await.map_err(TenancyError::Acquire) })
            .await?;
        // Until the slot is handed to a `TenantConn`, dropping this future
        // drops the slot, which discards the half-tagged connection.
        let mut state = SlotState::new(raw);

        let protocol = &self.inner.options.protocol;
        let tagged = async { protocol.tag(state.raw()?, tenant_id, scope).await }.await;
        if let Err(err) = tagged {
            let close_error = match state.take() {
                Some(raw) => raw.close().await.err(),
                None => None,
            };
            tracing::warn!(
                tenant_id = %tenant_id,
                error = %err,
                close_failed = close_error.is_some(),
                "failed to tag connection; closed it"
            );
            return Err(TenancyError::Tag {
                tenant_id: tenant_id.clone(),
                source: Box::new(err),
                close_error,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(tenant_id = %tenant_id, connection = id, "checked out tagged connection");
        Ok(TenantConn::new(id, tenant_id.clone(), state))
    }

    /// Check out a connection and start a transaction on it.
    ///
    /// In single-connection mode the transaction holds the pool's only
    /// connection; see [`PoolOptions::single_connection`].
    ///
    /// # Errors
    /// Any checkout error, or the `BEGIN` failure.
    pub async fn begin_tx(&self, scope: &Scope, cfg: &TxConfig) -> Result<TenantTx<S::Conn>> {
        let conn = self.checkout(scope).await?;
        conn.begin_tx(scope, cfg).await
    }

    /// Untag and release every tracked connection.
    ///
    /// Each connection gets an untag attempt and then a release (untag
    /// succeeded) or a physical close (anything failed), regardless of what
    /// happened to the others. Closing again is a no-op.
    ///
    /// # Errors
    /// `CloseError` with every rollback/untag/close failure encountered.
    pub async fn close(&self, scope: &Scope) -> std::result::Result<(), CloseError> {
        let conns = {
            let mut tracked = self.inner.tracked.lock().await;
            if tracked.closed {
                tracing::debug!(tenant_id = %self.inner.tenant_id, "tenant pool already closed");
                return Ok(());
            }
            tracked.closed = true;
            std::mem::take(&mut tracked.conns)
        };

        let mut errors = CloseError::new(self.inner.tenant_id.clone());
        for conn in &conns {
            self.release_conn(conn, scope, &mut errors).await;
        }
        tracing::debug!(
            tenant_id = %self.inner.tenant_id,
            connections = conns.len(),
            failures = errors.failures().len(),
            "tenant pool closed"
        );
        errors.into_result()
    }

    async fn release_conn(&self, conn: &TenantConn<S::Conn>, scope: &Scope, errors: &mut CloseError) {
        let id = conn.id();
        let tenant_id = &self.inner.tenant_id;
        let mut state = match conn.lock_for_cleanup(scope).await {
            Ok(state) => state,
            Err(err) => {
                // Still busy (e.g. an open transaction). The slot discards the
                // connection when its last handle drops.
                tracing::warn!(tenant_id = %tenant_id, connection = id, error = %err, "could not reach connection to untag it");
                errors.push(id, CleanupStage::Untag, err);
                return;
            }
        };
        let rollback_pending = state.rollback_pending();
        let Ok(tagged) = state.raw() else {
            return;
        };

        // The connection stays in its slot until the untag is acknowledged;
        // if this future is dropped first, the slot discards it.
        let mut clean = true;
        if rollback_pending {
            let rolled_back = scope
                .run(async { tagged.rollback().await.map_err(TenancyError::from) })
                .await;
            if let Err(err) = rolled_back {
                tracing::warn!(tenant_id = %tenant_id, connection = id, error = %err, "rollback before untag failed");
                errors.push(id, CleanupStage::Rollback, err);
                clean = false;
            }
        }

        if let Err(err) = self.inner.options.protocol.untag(tagged, scope).await {
            tracing::warn!(tenant_id = %tenant_id, connection = id, error = %err, "failed to untag connection");
            errors.push(id, CleanupStage::Untag, err);
            clean = false;
        }

        let Some(raw) = state.take() else {
            return;
        };
        drop(state);

        if clean {
            raw.release();
            tracing::debug!(tenant_id = %tenant_id, connection = id, "connection untagged and released");
        } else if let Err(err) = raw.close().await {
            tracing::warn!(tenant_id = %tenant_id, connection = id, error = %err, "failed to close connection");
            errors.push(id, CleanupStage::Close, TenancyError::from(err));
        } else {
            tracing::debug!(tenant_id = %tenant_id, connection = id, "connection closed after failed cleanup");
        }
    }
}

/// Open a tenant pool; shorthand for [`TenantPool::open`].
///
/// # Errors
/// See [`TenantPool::open`].
pub fn open<S: ConnectionSource>(
    parent: &Scope,
    source: S,
    tenant_id: impl Into<TenantId>,
    options: PoolOptions,
) -> Result<(TenantPool<S>, Scope)> {
    TenantPool::open(parent, source, tenant_id, options)
}

/// Close `pool` under `scope`; shorthand for [`TenantPool::close`].
///
/// # Errors
/// See [`TenantPool::close`].
pub async fn close<S: ConnectionSource>(
    scope: &Scope,
    pool: &TenantPool<S>,
) -> std::result::Result<(), CloseError> {
    pool.close(scope).await
}

impl<S: ConnectionSource> crate::handle::private::Sealed for TenantPool<S> {}
impl<S: ConnectionSource> TenantScoped for TenantPool<S> {}

#[async_trait]
impl<S: ConnectionSource> TenantExecutor for TenantPool<S> {
    type Conn = S::Conn;

    fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    async fn execute_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<S::Conn>,
    ) -> Result<DoneOf<S::Conn>> {
        let conn = self.checkout(scope).await?;
        conn.execute_in(scope, sql, args).await
    }

    async fn query_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<S::Conn>,
    ) -> Result<Vec<RowOf<S::Conn>>> {
        let conn = self.checkout(scope).await?;
        conn.query_in(scope, sql, args).await
    }

    async fn query_row_in(
        &self,
        scope: &Scope,
        sql: &str,
        args: ArgumentsOf<S::Conn>,
    ) -> Result<RowOf<S::Conn>> {
        let conn = self.checkout(scope).await?;
        conn.query_row_in(scope, sql, args).await
    }
}

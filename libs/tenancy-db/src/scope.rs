//! Request/operation-scoped carrier for the active tenant pool.
//!
//! A [`Scope`] is passed explicitly through every call boundary. It is never
//! mutated: deriving a child (`with_timeout`, `with_cancellation`, or
//! [`TenantPool::open`]) returns a new value and leaves the parent untouched.
//!
//! ```
//! use std::time::Duration;
//! use tenancy_db::Scope;
//!
//! let root = Scope::background();
//! let child = root.with_timeout(Duration::from_secs(5));
//! assert!(root.deadline().is_none());
//! assert!(child.deadline().is_some());
//! assert!(child.tenant_id().is_none());
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::driver::ConnectionSource;
use crate::{Result, TenancyError, TenantId, TenantPool};

/// Immutable, cheap-to-clone scope value.
#[derive(Clone, Default)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Clone, Default)]
struct ScopeInner {
    binding: Option<Binding>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

#[derive(Clone)]
struct Binding {
    tenant_id: TenantId,
    pool: Arc<dyn Any + Send + Sync>,
}

impl Scope {
    /// Root scope: no tenant, no deadline, never cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, f: impl FnOnce(&mut ScopeInner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Child scope whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child scope with `deadline`, or the parent's if that is earlier.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(|inner| {
            inner.deadline = Some(inner.deadline.map_or(deadline, |d| d.min(deadline)));
        })
    }

    /// Child scope that can be cancelled with the returned token.
    ///
    /// Cancelling the parent also cancels the child.
    #[must_use]
    pub fn with_cancellation(&self) -> (Self, CancellationToken) {
        let token = self
            .inner
            .cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let scope = self.derive(|inner| inner.cancel = Some(token.clone()));
        (scope, token)
    }

    pub(crate) fn with_tenant_pool<S: ConnectionSource>(&self, pool: TenantPool<S>) -> Self {
        self.derive(|inner| {
            inner.binding = Some(Binding {
                tenant_id: pool.tenant_id().clone(),
                pool: Arc::new(pool),
            });
        })
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Tenant id bound by the nearest `open`, if any.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.inner.binding.as_ref().map(|b| &b.tenant_id)
    }

    /// Tenant pool bound by the nearest `open`, if it uses source `S`.
    #[must_use]
    pub fn pool<S: ConnectionSource>(&self) -> Option<TenantPool<S>> {
        self.inner
            .binding
            .as_ref()
            .and_then(|b| b.pool.downcast_ref::<TenantPool<S>>())
            .cloned()
    }

    /// Drive `fut` under this scope's deadline and cancellation.
    ///
    /// # Errors
    /// `DeadlineExceeded` or `Cancelled` when the scope ends first; otherwise
    /// whatever `fut` returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(TenancyError::Cancelled);
        }
        let bounded = async {
            match self.inner.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_elapsed| TenancyError::DeadlineExceeded)?,
                None => fut.await,
            }
        };
        match &self.inner.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(TenancyError::Cancelled),
                    res = bounded => res,
                }
            }
            None => bounded.await,
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("tenant_id", &self.tenant_id())
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Tenant pool placed on an ancestor scope by `TenantPool::open`.
///
/// # Panics
/// Panics if no ancestor scope was opened with a pool over source `S`. Running
/// on without a tenant pool would risk an unscoped, cross-tenant query.
#[must_use]
pub fn current_pool<S: ConnectionSource>(scope: &Scope) -> TenantPool<S> {
    match scope.pool::<S>() {
        Some(pool) => pool,
        None => panic!(
            "no tenant pool in scope: TenantPool::open must run before current_pool ({scope:?})"
        ),
    }
}

/// Tenant id placed on an ancestor scope by `TenantPool::open`.
///
/// # Panics
/// Panics if no ancestor scope was opened.
#[must_use]
pub fn current_tenant_id(scope: &Scope) -> TenantId {
    match scope.tenant_id() {
        Some(tenant_id) => tenant_id.clone(),
        None => panic!("no tenant id in scope: TenantPool::open must run before current_tenant_id"),
    }
}

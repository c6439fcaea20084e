#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Axum integration for tenant pools.
//!
//! [`tenancy_middleware`] opens a [`TenantPool`] for every request, exposes
//! it to handlers through the request's [`Scope`], and closes it once the
//! handler is done. Handlers pick it up with the [`TenantScope`] and
//! [`TenantDb`] extractors.
//!
//! ```ignore
//! let state = TenancyState::from_extension::<AuthTenant>(source, PoolOptions::new());
//! let app = Router::new()
//!     .route("/users", get(list_users))
//!     .layer(middleware::from_fn_with_state(state, tenancy_middleware::<PgSource>))
//!     .layer(auth_layer);
//! ```

use std::fmt;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use http::{Extensions, StatusCode};
use tenancy_db::{ConnectionSource, PoolOptions, Scope, TenancyError, TenantId, TenantPool};

/// Looks up the tenant of a request from extensions set by earlier layers.
pub type TenantResolver = Arc<dyn Fn(&Extensions) -> Option<TenantId> + Send + Sync>;

/// Why a request could not be given (or did not get) a tenant pool.
#[derive(Debug, thiserror::Error)]
pub enum TenancyRejection {
    #[error("request has no tenant")]
    MissingTenant,

    #[error("failed to open tenant pool: {0}")]
    Open(#[source] TenancyError),

    /// An extractor ran on a route without the tenancy middleware.
    #[error("{0} not found - tenancy middleware not configured")]
    NotConfigured(&'static str),
}

impl IntoResponse for TenancyRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let body = axum::Json(serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Internal Server Error"),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// State for [`tenancy_middleware`].
#[derive(Clone)]
pub struct TenancyState<S: ConnectionSource> {
    source: S,
    options: PoolOptions,
    resolver: TenantResolver,
}

impl<S: ConnectionSource> fmt::Debug for TenancyState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenancyState")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> TenancyState<S> {
    #[must_use]
    pub fn new<F>(source: S, options: PoolOptions, resolver: F) -> Self
    where
        F: Fn(&Extensions) -> Option<TenantId> + Send + Sync + 'static,
    {
        Self {
            source,
            options,
            resolver: Arc::new(resolver),
        }
    }

    /// Resolve the tenant from an extension of type `T` inserted upstream,
    /// typically by authentication middleware.
    #[must_use]
    pub fn from_extension<T>(source: S, options: PoolOptions) -> Self
    where
        T: Clone + Into<TenantId> + Send + Sync + 'static,
    {
        Self::new(source, options, |ext: &Extensions| {
            ext.get::<T>().cloned().map(Into::into)
        })
    }

}

/// Open a tenant pool for the request, run the handler, close the pool.
///
/// The parent scope is the request's existing [`Scope`] extension, if an
/// earlier layer set one. A request without a tenant, or whose pool cannot be
/// opened, gets a 500 and never reaches the handler. Close failures are logged
/// and do not change the handler's response. If the handler future is dropped
/// (client gone, panic) the pool is closed on a spawned task.
pub async fn tenancy_middleware<S: ConnectionSource>(
    State(state): State<TenancyState<S>>,
    mut request: Request,
    next: Next,
) -> Response {
    let parent = request
        .extensions()
        .get::<Scope>()
        .cloned()
        .unwrap_or_else(Scope::background);

    let tenant_id = match (state.resolver)(request.extensions()) {
        Some(tenant_id) if !tenant_id.is_empty() => tenant_id,
        _ => {
            tracing::error!(path = %request.uri().path(), "request has no tenant; refusing to run it");
            return TenancyRejection::MissingTenant.into_response();
        }
    };

    let (pool, scope) = match TenantPool::open(&parent, state.source.clone(), tenant_id, state.options.clone()) {
        Ok(opened) => opened,
        Err(err) => {
            tracing::error!(error = %err, "failed to open tenant pool");
            return TenancyRejection::Open(err).into_response();
        }
    };

    request.extensions_mut().insert(scope.clone());
    let guard = CloseGuard {
        pool: Some(pool),
        scope,
    };
    let response = next.run(request).await;
    guard.close().await;
    response
}

/// Closes the request's pool when the middleware finishes or is dropped.
struct CloseGuard<S: ConnectionSource> {
    pool: Option<TenantPool<S>>,
    scope: Scope,
}

impl<S: ConnectionSource> CloseGuard<S> {
    async fn close(mut self) {
        if let Some(pool) = self.pool.take() {
            close_logged(&pool, &self.scope).await;
        }
    }
}

impl<S: ConnectionSource> Drop for CloseGuard<S> {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let scope = self.scope.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                close_logged(&pool, &scope).await;
            });
        } else {
            tracing::error!(
                tenant_id = %pool.tenant_id(),
                "tenant pool dropped outside a runtime; connections are discarded unclosed"
            );
        }
    }
}

async fn close_logged<S: ConnectionSource>(pool: &TenantPool<S>, scope: &Scope) {
    if let Err(err) = pool.close(scope).await {
        tracing::error!(
            tenant_id = %err.tenant_id(),
            failures = err.failures().len(),
            error = %err,
            "failed to close tenant pool"
        );
    }
}

fn tenant_scope(parts: &Parts) -> Option<&Scope> {
    parts
        .extensions
        .get::<Scope>()
        .filter(|scope| scope.tenant_id().is_some())
}

/// Extractor for the request's tenant [`Scope`].
#[derive(Debug, Clone)]
pub struct TenantScope(pub Scope);

impl<St> FromRequestParts<St> for TenantScope
where
    St: Send + Sync,
{
    type Rejection = TenancyRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        tenant_scope(parts)
            .cloned()
            .map(TenantScope)
            .ok_or(TenancyRejection::NotConfigured("tenant scope"))
    }
}

/// Extractor for the request's [`TenantPool`].
#[derive(Debug, Clone)]
pub struct TenantDb<S: ConnectionSource>(pub TenantPool<S>);

impl<S, St> FromRequestParts<St> for TenantDb<S>
where
    S: ConnectionSource,
    St: Send + Sync,
{
    type Rejection = TenancyRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        tenant_scope(parts)
            .and_then(Scope::pool::<S>)
            .map(TenantDb)
            .ok_or(TenancyRejection::NotConfigured("tenant pool"))
    }
}

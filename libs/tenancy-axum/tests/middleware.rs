#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use axum::{
    Extension, Router,
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
};
use http_body_util::BodyExt;
use tenancy_axum::{TenancyState, TenantDb, TenantScope, tenancy_middleware};
use tenancy_db::testing::{FakeEvent, FakeSource};
use tenancy_db::{PoolOptions, Scope, TenantExecutor, TenantId};
use tower::ServiceExt; // for `oneshot`
use tracing_test::traced_test;

/// Stand-in for what an authentication layer would put on the request.
#[derive(Clone)]
struct AuthTenant(String);

impl From<AuthTenant> for TenantId {
    fn from(tenant: AuthTenant) -> Self {
        TenantId::new(tenant.0)
    }
}

async fn whoami(TenantScope(scope): TenantScope, TenantDb(pool): TenantDb<FakeSource>) -> String {
    let row = pool
        .query_row_in(&scope, "SELECT current_tenant()", Vec::new())
        .await
        .unwrap();
    row.tenant.unwrap_or_default()
}

async fn unscoped(TenantScope(scope): TenantScope) -> String {
    scope.tenant_id().map(ToString::to_string).unwrap_or_default()
}

fn app(source: &FakeSource) -> Router {
    let state = TenancyState::from_extension::<AuthTenant>(source.clone(), PoolOptions::new());
    Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn_with_state(
            state,
            tenancy_middleware::<FakeSource>,
        ))
}

fn request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn handler_runs_on_a_tagged_connection_that_is_released_afterwards() {
    let source = FakeSource::new();
    let app = app(&source).layer(Extension(AuthTenant("tenant-a".to_owned())));

    let response = app.oneshot(request("/whoami")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "tenant-a");
    assert_eq!(
        source.events_for(1),
        vec![
            FakeEvent::Acquired(1),
            FakeEvent::Tagged {
                conn: 1,
                tenant: "tenant-a".to_owned()
            },
            FakeEvent::Statement {
                conn: 1,
                sql: "SELECT current_tenant()".to_owned()
            },
            FakeEvent::Untagged(1),
            FakeEvent::Released(1),
        ]
    );
    assert_eq!(source.live(), 0);
}

#[tokio::test]
async fn missing_tenant_is_an_internal_error() {
    let source = FakeSource::new();
    let app = app(&source);

    let response = app.oneshot(request("/whoami")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(source.acquired(), 0);
}

#[tokio::test]
async fn empty_tenant_is_an_internal_error() {
    let source = FakeSource::new();
    let app = app(&source).layer(Extension(AuthTenant(String::new())));

    let response = app.oneshot(request("/whoami")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(source.acquired(), 0);
}

#[tokio::test]
async fn extractors_reject_routes_without_the_middleware() {
    let app = Router::new().route("/unscoped", get(unscoped));

    let response = app.oneshot(request("/unscoped")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_text(response).await;
    assert!(body.contains("\"status\":500"));
}

#[tokio::test]
#[traced_test]
async fn close_failure_is_logged_and_response_kept() {
    let source = FakeSource::new();
    source.fail_untag_for(1);
    let app = app(&source).layer(Extension(AuthTenant("tenant-a".to_owned())));

    let response = app.oneshot(request("/whoami")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "tenant-a");
    assert_eq!(source.events_for(1).last(), Some(&FakeEvent::Closed(1)));
    assert!(logs_contain("failed to close tenant pool"));
}

#[tokio::test]
async fn custom_resolver_and_single_connection_options_apply() {
    let source = FakeSource::new();
    let state = TenancyState::new(
        source.clone(),
        PoolOptions::new().single_connection(),
        |_ext: &http::Extensions| Some(TenantId::from("fixed")),
    );
    let app = Router::new()
        .route(
            "/twice",
            get(|TenantDb(pool): TenantDb<FakeSource>| async move {
                pool.execute("SELECT 1", Vec::new()).await.unwrap();
                pool.execute("SELECT 2", Vec::new()).await.unwrap();
                pool.tenant_id().to_string()
            }),
        )
        .layer(middleware::from_fn_with_state(
            state,
            tenancy_middleware::<FakeSource>,
        ));

    let response = app.oneshot(request("/twice")).await.unwrap();

    assert_eq!(body_text(response).await, "fixed");
    assert_eq!(source.acquired(), 1);
    assert_eq!(source.live(), 0);
}

fn with_tenancy(router: Router, source: &FakeSource) -> Router {
    let state = TenancyState::from_extension::<AuthTenant>(source.clone(), PoolOptions::new());
    router.layer(middleware::from_fn_with_state(
        state,
        tenancy_middleware::<FakeSource>,
    ))
}

#[tokio::test(start_paused = true)]
async fn dropped_request_still_untags_and_releases() {
    let source = FakeSource::new();
    let router = Router::new().route(
        "/slow",
        get(|TenantDb(pool): TenantDb<FakeSource>| async move {
            pool.execute("SELECT 1", Vec::new()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            "done"
        }),
    );
    let app = with_tenancy(router, &source).layer(Extension(AuthTenant("tenant-a".to_owned())));

    let abandoned = tokio::time::timeout(Duration::from_millis(10), app.oneshot(request("/slow"))).await;
    assert!(abandoned.is_err());
    // Let the close spawned by the dropped middleware run.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        source.events_for(1),
        vec![
            FakeEvent::Acquired(1),
            FakeEvent::Tagged {
                conn: 1,
                tenant: "tenant-a".to_owned()
            },
            FakeEvent::Statement {
                conn: 1,
                sql: "SELECT 1".to_owned()
            },
            FakeEvent::Untagged(1),
            FakeEvent::Released(1),
        ]
    );
    assert_eq!(source.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_dropped_while_closing_discards_the_connection() {
    let source = FakeSource::new();
    let slow = source.clone();
    let router = Router::new().route(
        "/slow-close",
        get(move |TenantDb(pool): TenantDb<FakeSource>| async move {
            pool.execute("SELECT 1", Vec::new()).await.unwrap();
            slow.set_statement_delay(Some(Duration::from_secs(5)));
            "done"
        }),
    );
    let app = with_tenancy(router, &source).layer(Extension(AuthTenant("tenant-a".to_owned())));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), app.oneshot(request("/slow-close"))).await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let events = source.events_for(1);
    assert_eq!(events.last(), Some(&FakeEvent::Discarded(1)));
    assert!(!events.contains(&FakeEvent::Released(1)));
    assert_eq!(source.live(), 0);
}

#[tokio::test]
async fn upstream_scope_is_the_parent_of_the_request_scope() {
    let source = FakeSource::new();
    let parent = Scope::background().with_timeout(Duration::from_secs(30));
    let expected = parent.deadline();
    let router = Router::new().route(
        "/deadline",
        get(move |TenantScope(scope): TenantScope| async move {
            let inherited = scope.deadline() == expected
                && scope.tenant_id().map(TenantId::as_str) == Some("tenant-a");
            inherited.to_string()
        }),
    );
    let app = with_tenancy(router, &source)
        .layer(Extension(AuthTenant("tenant-a".to_owned())))
        .layer(Extension(parent));

    let response = app.oneshot(request("/deadline")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "true");
}

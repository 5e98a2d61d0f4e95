mod handlers;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};

use tenantgate_core::permission::{Permission, PermissionRequirement, RequestInfo};
use tenantgate_core::tenant::TenantContext;
use tenantgate_storage::guard;
use tenantgate_storage::traits::CacheStore;

pub use types::*;

use crate::error::{AuthzError, error_json};
use crate::middleware::auth::{AuthState, rest_auth_middleware};
use crate::resolver::PermissionResolver;
use crate::service::AuthzService;

const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LENGTH: usize = 128;

pub struct AppState<S: CacheStore, R: PermissionResolver> {
    pub service: Arc<AuthzService<S, R>>,
}

impl<S: CacheStore, R: PermissionResolver> AppState<S, R> {
    pub fn new(service: Arc<AuthzService<S, R>>) -> Self {
        Self { service }
    }
}

impl<S: CacheStore, R: PermissionResolver> Clone for AppState<S, R> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

/// Identifier of the inbound request, taken from `x-request-id` or generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LENGTH)
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()));

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Runs the rest of the stack inside the authenticated tenant's scope, so any
/// connection bound further down must be bound to that tenant.
async fn tenant_scope_middleware<S, R>(
    State(state): State<AppState<S, R>>,
    request: Request<Body>,
    next: Next,
) -> Response
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let Some(tenant_id) = request
        .extensions()
        .get::<TenantContext>()
        .map(|ctx| ctx.tenant_id.clone())
    else {
        return next.run(request).await;
    };

    match guard(tenant_id, || next.run(request)).await {
        Ok(response) => response,
        Err(e) => AuthzError::Context(e)
            .with_mode(state.service.is_production())
            .into_response(),
    }
}

struct RouteGuard<S: CacheStore, R: PermissionResolver> {
    state: AppState<S, R>,
    requirement: Option<Arc<PermissionRequirement>>,
}

impl<S: CacheStore, R: PermissionResolver> Clone for RouteGuard<S, R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

async fn enforce_requirement<S, R>(
    State(guard): State<RouteGuard<S, R>>,
    request: Request<Body>,
    next: Next,
) -> Response
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let Some(ctx) = request.extensions().get::<TenantContext>().cloned() else {
        return error_json(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "missing tenant context",
        );
    };
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let info = RequestInfo::new(
        request_id,
        request.uri().path(),
        request.method().as_str(),
    );

    let service = &guard.state.service;
    match service
        .require_permissions(&ctx, &info, guard.requirement.as_deref())
        .await
    {
        Ok(_) => next.run(request).await,
        Err(e) => e.with_mode(service.is_production()).into_response(),
    }
}

/// Wraps `route` so the caller must meet `requirement` before the handler
/// runs. `None` marks a protected route with no declaration, which rejects
/// every request.
pub fn require_permissions<S, R>(
    state: &AppState<S, R>,
    requirement: Option<PermissionRequirement>,
    route: MethodRouter<AppState<S, R>>,
) -> MethodRouter<AppState<S, R>>
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let guard = RouteGuard {
        state: state.clone(),
        requirement: requirement.map(Arc::new),
    };
    route.route_layer(middleware::from_fn_with_state(
        guard,
        enforce_requirement::<S, R>,
    ))
}

fn single(resource: &str, action: &str) -> Option<PermissionRequirement> {
    Some(PermissionRequirement::all_of([Permission::new(
        resource, action,
    )]))
}

/// Routes carrying the authenticated-context surface, without the outer
/// request-id and auth layers.
pub fn authz_routes<S, R>(state: &AppState<S, R>) -> Router<AppState<S, R>>
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    Router::new()
        .route("/v1/authz/check", post(handlers::check::<S, R>))
        .route(
            "/v1/authz/invalidate",
            require_permissions(
                state,
                single("authz", "invalidate"),
                post(handlers::invalidate::<S, R>),
            ),
        )
        .route(
            "/v1/authz/invalidate/role",
            require_permissions(
                state,
                single("authz", "invalidate"),
                post(handlers::invalidate_role::<S, R>),
            ),
        )
        .route(
            "/v1/authz/metrics",
            require_permissions(
                state,
                single("authz", "read"),
                get(handlers::authorization_metrics::<S, R>),
            ),
        )
        .route(
            "/v1/authz/metrics/reset",
            require_permissions(
                state,
                single("authz", "admin"),
                post(handlers::reset_metrics::<S, R>),
            ),
        )
}

pub fn create_router<S, R>(state: AppState<S, R>, auth: AuthState) -> Router
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    build_router(state, auth, Router::new())
}

/// Like [`create_router`], with extra application routes merged in before
/// the auth and request-id layers are applied.
pub fn build_router<S, R>(
    state: AppState<S, R>,
    auth: AuthState,
    extra: Router<AppState<S, R>>,
) -> Router
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let tenant_scope =
        middleware::from_fn_with_state(state.clone(), tenant_scope_middleware::<S, R>);
    authz_routes(&state)
        .merge(extra)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics::<S, R>))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(tenant_scope)
        .layer(middleware::from_fn_with_state(auth, rest_auth_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderName;
    use axum_test::TestServer;
    use serde_json::{Value, json};

    use tenantgate_core::keyspace::Keyspace;
    use tenantgate_core::tenant::{ActorId, TenantId};
    use tenantgate_storage::memory::InMemoryCacheStore;

    use std::sync::Mutex;

    use tenantgate_core::permission::DenialRecord;
    use tenantgate_storage::current_tenant;

    use crate::audit::DenialSink;
    use crate::cache::{AuthorizationCache, CacheSettings};
    use crate::metrics::AuthzMetrics;
    use crate::resolver::{ResolveError, ResolvedPermissions, StaticPermissionResolver};

    struct Fixture {
        tenant: TenantId,
        actor: ActorId,
        store: Arc<InMemoryCacheStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tenant: TenantId::new(uuid::Uuid::new_v4()),
                actor: ActorId::new(uuid::Uuid::new_v4()),
                store: Arc::new(InMemoryCacheStore::new()),
            }
        }

        fn ctx(&self) -> TenantContext {
            TenantContext::new(self.tenant.clone(), self.actor.clone(), "sess", "member")
        }

        fn state<R: PermissionResolver + 'static>(
            &self,
            resolver: R,
            production: bool,
        ) -> AppState<InMemoryCacheStore, R> {
            let metrics = Arc::new(AuthzMetrics::new());
            let cache = AuthorizationCache::new(
                Arc::clone(&self.store),
                Arc::new(Keyspace::default()),
                CacheSettings::default(),
                Arc::clone(&metrics),
            );
            let service = AuthzService::new(cache, Arc::new(resolver), metrics)
                .with_production(production);
            AppState::new(Arc::new(service))
        }

        fn resolver(&self, permissions: &[&str]) -> StaticPermissionResolver {
            StaticPermissionResolver::new()
                .with_role("member", permissions.iter().copied())
                .assign(self.tenant.clone(), self.actor.clone(), "member")
        }

        fn server(&self, permissions: &[&str], production: bool) -> TestServer {
            let state = self.state(self.resolver(permissions), production);
            let app = create_router(state, AuthState::with_dev_context(self.ctx()));
            TestServer::new(app).unwrap()
        }
    }

    struct DownResolver;

    impl PermissionResolver for DownResolver {
        async fn resolve(
            &self,
            _tenant_id: &TenantId,
            _actor_id: &ActorId,
        ) -> Result<ResolvedPermissions, ResolveError> {
            Err(ResolveError::Unavailable("connection refused".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<DenialRecord>>);

    impl DenialSink for RecordingSink {
        fn record_denial(&self, denial: &DenialRecord) {
            self.0.lock().unwrap().push(denial.clone());
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let fx = Fixture::new();
        let server = fx.server(&[], false);

        let response = server.get("/healthz").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn check_allows_then_hits_cache() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read"], false);
        let request = json!({"permissions": ["reports:read"]});

        let first = server.post("/v1/authz/check").json(&request).await;
        first.assert_status_ok();
        let first: Value = first.json();
        assert_eq!(first["allowed"], true);
        assert_eq!(first["cacheHit"], false);
        assert!(first.get("denial").is_none());

        let second: Value = server.post("/v1/authz/check").json(&request).await.json();
        assert_eq!(second["cacheHit"], true);
    }

    #[tokio::test]
    async fn check_denial_shows_details_outside_production() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read"], false);

        let response = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:read", "reports:write"], "evaluator": "allOf"}))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["allowed"], false);
        assert_eq!(body["denial"]["reason"], "insufficient_permissions");
        assert_eq!(body["denial"]["granted"], json!(["reports:read"]));
        assert_eq!(body["denial"]["evaluator"], "allOf");
    }

    #[tokio::test]
    async fn check_denial_is_redacted_in_production() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read"], true);

        let body: Value = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["billing:manage"]}))
            .await
            .json();

        assert_eq!(body["allowed"], false);
        assert_eq!(body["denial"]["message"], "insufficient permissions");
        assert!(body["denial"].get("granted").is_none());
        assert!(body["denial"].get("required").is_none());
        assert!(body["denial"].get("reason").is_none());
    }

    #[tokio::test]
    async fn check_any_of_allows_partial_match() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read"], false);

        let body: Value = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:write", "reports:read"], "evaluator": "anyOf"}))
            .await
            .json();

        assert_eq!(body["allowed"], true);
    }

    #[tokio::test]
    async fn check_rejects_empty_and_malformed_permissions() {
        let fx = Fixture::new();
        let server = fx.server(&[], false);

        let empty = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": []}))
            .await;
        empty.assert_status(StatusCode::BAD_REQUEST);

        let malformed = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["no-separator"]}))
            .await;
        malformed.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = malformed.json();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn resolver_outage_returns_503() {
        let fx = Fixture::new();
        let state = fx.state(DownResolver, true);
        let server =
            TestServer::new(create_router(state, AuthState::with_dev_context(fx.ctx()))).unwrap();

        let response = server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:read"]}))
            .await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "PERMISSION_RESOLUTION_FAILED");
        assert!(!body.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn invalidate_requires_declared_permission() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read"], false);

        let response = server.post("/v1/authz/invalidate").json(&json!({})).await;

        response.assert_status(StatusCode::FORBIDDEN);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "FORBIDDEN");
        assert_eq!(body["error"]["details"]["required"], json!(["authz:invalidate"]));
    }

    #[tokio::test]
    async fn invalidate_drops_callers_tenant_entries() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read", "authz:invalidate"], false);

        server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:read"]}))
            .await
            .assert_status_ok();
        assert!(!fx.store.is_empty());

        let response = server.post("/v1/authz/invalidate").json(&json!({})).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["scope"], "tenant");
        assert_eq!(body["removed"], 1);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn invalidate_single_actor() {
        let fx = Fixture::new();
        let server = fx.server(&["authz:invalidate"], false);

        let response = server
            .post("/v1/authz/invalidate")
            .json(&json!({"actorId": fx.actor.to_string()}))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["scope"], "actor");
    }

    #[tokio::test]
    async fn invalidate_rejects_bad_actor_id() {
        let fx = Fixture::new();
        let server = fx.server(&["authz:invalidate"], false);

        let response = server
            .post("/v1/authz/invalidate")
            .json(&json!({"actorId": "not-a-uuid"}))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalidate_role_reports_role_scope() {
        let fx = Fixture::new();
        let server = fx.server(&["authz:invalidate"], false);

        let response = server
            .post("/v1/authz/invalidate/role")
            .json(&json!({"roleId": "member"}))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["scope"], "role");
    }

    #[tokio::test]
    async fn metrics_and_reset() {
        let fx = Fixture::new();
        let server = fx.server(&["reports:read", "authz:read", "authz:admin"], false);

        server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:read"]}))
            .await
            .assert_status_ok();

        let before: Value = server.get("/v1/authz/metrics").await.json();
        // the route guard's own evaluation is counted too
        assert!(before["totalEvaluations"].as_u64().unwrap() >= 2);
        assert_eq!(before["p99TargetMs"], 10.0);

        server
            .post("/v1/authz/metrics/reset")
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let after: Value = server.get("/v1/authz/metrics").await.json();
        // only the guard evaluation for this read
        assert_eq!(after["totalEvaluations"], 1);
    }

    #[tokio::test]
    async fn prometheus_endpoint_skips_auth() {
        let fx = Fixture::new();
        let state = fx.state(fx.resolver(&[]), false);
        let server =
            TestServer::new(create_router(state, AuthState::trusted_headers())).unwrap();

        let response = server.get("/metrics").await;
        response.assert_status_ok();
        assert!(response.text().contains("tenantgate_authz_evaluations_total"));

        server
            .post("/v1/authz/check")
            .json(&json!({"permissions": ["reports:read"]}))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn undeclared_protected_route_fails_closed() {
        let fx = Fixture::new();
        let state = fx.state(fx.resolver(&["reports:read"]), false);
        let extra = Router::new().route(
            "/v1/reports",
            require_permissions(&state, None, get(|| async { "reports" })),
        );
        let app = build_router(state.clone(), AuthState::with_dev_context(fx.ctx()), extra);
        let server = TestServer::new(app).unwrap();

        let response = server.get("/v1/reports").await;

        response.assert_status(StatusCode::FORBIDDEN);
        let body: Value = response.json();
        assert_eq!(
            body["error"]["details"]["reason"],
            "missing_permission_declaration"
        );
        assert_eq!(state.service.authorization_metrics().errors, 1);
        assert_eq!(state.service.resolver().calls(), 0);
    }

    #[tokio::test]
    async fn declared_route_runs_handler_when_allowed() {
        let fx = Fixture::new();
        let state = fx.state(fx.resolver(&["reports:read"]), false);
        let extra = Router::new().route(
            "/v1/reports",
            require_permissions(
                &state,
                Some(PermissionRequirement::all_of([Permission::new(
                    "reports", "read",
                )])),
                get(|| async { "reports" }),
            ),
        );
        let server = TestServer::new(build_router(
            state,
            AuthState::with_dev_context(fx.ctx()),
            extra,
        ))
        .unwrap();

        let response = server.get("/v1/reports").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "reports");
    }

    #[tokio::test]
    async fn check_denial_records_served_route_not_body_claims() {
        let fx = Fixture::new();
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(AuthzMetrics::new());
        let cache = AuthorizationCache::new(
            Arc::clone(&fx.store),
            Arc::new(Keyspace::default()),
            CacheSettings::default(),
            Arc::clone(&metrics),
        );
        let service = AuthzService::new(cache, Arc::new(fx.resolver(&["reports:read"])), metrics)
            .with_denial_sink(Arc::clone(&sink) as Arc<dyn DenialSink>);
        let server = TestServer::new(create_router(
            AppState::new(Arc::new(service)),
            AuthState::with_dev_context(fx.ctx()),
        ))
        .unwrap();

        let body: Value = server
            .post("/v1/authz/check")
            .json(&json!({
                "permissions": ["billing:manage"],
                "route": "/v1/admin/users",
                "method": "DELETE",
            }))
            .await
            .json();
        assert_eq!(body["allowed"], false);

        let denials = sink.0.lock().unwrap();
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].route, "/v1/authz/check");
        assert_eq!(denials[0].method, "POST");
    }

    #[tokio::test]
    async fn handlers_run_inside_callers_tenant_scope() {
        let fx = Fixture::new();
        let state = fx.state(fx.resolver(&["reports:read"]), false);
        let extra = Router::new().route(
            "/v1/whoami",
            require_permissions(
                &state,
                single("reports", "read"),
                get(|| async {
                    current_tenant()
                        .map(|t| t.to_string())
                        .unwrap_or_default()
                }),
            ),
        );
        let server = TestServer::new(build_router(
            state,
            AuthState::with_dev_context(fx.ctx()),
            extra,
        ))
        .unwrap();

        let response = server.get("/v1/whoami").await;

        response.assert_status_ok();
        assert_eq!(response.text(), fx.tenant.to_string());
        assert_eq!(current_tenant(), None);
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_generated() {
        let fx = Fixture::new();
        let server = fx.server(&[], false);
        let header = HeaderName::from_static(REQUEST_ID_HEADER);

        let echoed = server
            .get("/healthz")
            .add_header(header.clone(), HeaderValue::from_static("req_abc"))
            .await;
        assert_eq!(echoed.header(header.clone()), "req_abc");

        let generated = server.get("/healthz").await;
        let value = generated.header(header);
        assert!(value.to_str().unwrap().starts_with("req_"));
    }
}

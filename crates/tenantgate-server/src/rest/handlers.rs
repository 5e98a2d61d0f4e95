use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use tenantgate_core::permission::{Permission, PermissionRequirement, RequestInfo};
use tenantgate_core::tenant::{ActorId, TenantContext};
use tenantgate_storage::traits::CacheStore;

use crate::error::error_json;
use crate::metrics;
use crate::resolver::PermissionResolver;

use super::types::*;
use super::{AppState, RequestId};

fn bad_request(message: &str) -> Response {
    error_json(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
}

pub async fn healthz() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub async fn prometheus_metrics<S, R>(State(state): State<AppState<S, R>>) -> impl IntoResponse
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    metrics::metrics_handler(State(state.service.metrics().clone())).await
}

pub async fn check<S, R>(
    State(state): State<AppState<S, R>>,
    Extension(ctx): Extension<TenantContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    method: Method,
    uri: Uri,
    Json(req): Json<CheckRequest>,
) -> Response
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    if req.permissions.is_empty() {
        return bad_request("permissions must not be empty");
    }
    let permissions = match req
        .permissions
        .iter()
        .map(|raw| Permission::parse(raw))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(permissions) => permissions,
        Err(e) => return bad_request(&e.to_string()),
    };
    let requirement = PermissionRequirement {
        permissions,
        evaluator: req.evaluator,
    };
    // Denials are recorded against the request actually served.
    let info = RequestInfo::new(request_id, uri.path(), method.as_str());

    let production = state.service.is_production();
    match state
        .service
        .authorize(&ctx, &info, Some(&requirement))
        .await
    {
        Ok(decision) => Json(CheckResponse {
            allowed: decision.allowed,
            cache_hit: decision.cache_hit,
            denial: decision.denial.map(|d| d.public_view(production)),
        })
        .into_response(),
        Err(e) => e.with_mode(production).into_response(),
    }
}

pub async fn invalidate<S, R>(
    State(state): State<AppState<S, R>>,
    Extension(ctx): Extension<TenantContext>,
    Json(req): Json<InvalidateRequest>,
) -> Response
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let actor_id = match req.actor_id.as_deref().map(ActorId::parse).transpose() {
        Ok(actor_id) => actor_id,
        Err(_) => return bad_request("actorId must be a canonical UUID"),
    };

    match state
        .service
        .invalidate_abac_cache(&ctx.tenant_id, actor_id.as_ref())
        .await
    {
        Ok(removed) => Json(InvalidateResponse {
            removed,
            scope: if actor_id.is_some() { "actor" } else { "tenant" },
        })
        .into_response(),
        Err(e) => e.with_mode(state.service.is_production()).into_response(),
    }
}

pub async fn invalidate_role<S, R>(
    State(state): State<AppState<S, R>>,
    Extension(ctx): Extension<TenantContext>,
    Json(req): Json<InvalidateRoleRequest>,
) -> Response
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    if req.role_id.trim().is_empty() {
        return bad_request("roleId must not be empty");
    }

    match state
        .service
        .invalidate_abac_cache_for_role(&ctx.tenant_id, &req.role_id)
        .await
    {
        Ok(removed) => Json(InvalidateResponse {
            removed,
            scope: "role",
        })
        .into_response(),
        Err(e) => e.with_mode(state.service.is_production()).into_response(),
    }
}

pub async fn authorization_metrics<S, R>(State(state): State<AppState<S, R>>) -> impl IntoResponse
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    Json(state.service.authorization_metrics())
}

pub async fn reset_metrics<S, R>(State(state): State<AppState<S, R>>) -> impl IntoResponse
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    state.service.reset_authorization_metrics();
    tracing::info!(target: "audit", event = "authz_metrics_reset", "authorization metrics reset");
    StatusCode::NO_CONTENT
}

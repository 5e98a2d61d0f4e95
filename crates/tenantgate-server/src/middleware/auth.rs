use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use tenantgate_core::tenant::{ActorId, TenantContext, TenantId};

use crate::config::{AuthConfig, AuthMode, ConfigError};
use crate::error::error_json;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const SESSION_HEADER: &str = "x-session-id";
pub const ROLE_HEADER: &str = "x-role";

/// How callers are identified. `Dev` attaches one fixed context to every
/// request; `TrustedHeaders` reads it from headers set by an upstream proxy.
#[derive(Debug, Clone)]
pub struct AuthState {
    dev_context: Option<TenantContext>,
}

impl AuthState {
    pub fn dev_mode() -> Self {
        Self::with_dev_context(TenantContext::new(
            TenantId::new(uuid::Uuid::nil()),
            ActorId::new(uuid::Uuid::nil()),
            "dev",
            "admin",
        ))
    }

    pub fn with_dev_context(ctx: TenantContext) -> Self {
        Self {
            dev_context: Some(ctx),
        }
    }

    pub fn trusted_headers() -> Self {
        Self { dev_context: None }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        match config.mode {
            AuthMode::TrustedHeaders => Ok(Self::trusted_headers()),
            AuthMode::Dev => {
                let tenant_id = TenantId::parse(&config.dev_tenant_id)
                    .map_err(|e| ConfigError::Validation(format!("auth.dev_tenant_id: {e}")))?;
                let user_id = ActorId::parse(&config.dev_user_id)
                    .map_err(|e| ConfigError::Validation(format!("auth.dev_user_id: {e}")))?;
                Ok(Self::with_dev_context(TenantContext::new(
                    tenant_id,
                    user_id,
                    "dev",
                    config.dev_role.clone(),
                )))
            }
        }
    }

    fn is_dev_mode(&self) -> bool {
        self.dev_context.is_some()
    }
}

fn skip_auth(path: &str) -> bool {
    matches!(path, "/healthz" | "/metrics")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn context_from_headers(headers: &HeaderMap) -> Result<TenantContext, Response> {
    let tenant_raw = header_str(headers, TENANT_HEADER).ok_or_else(|| {
        error_json(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "missing x-tenant-id header",
        )
    })?;
    let user_raw = header_str(headers, USER_HEADER).ok_or_else(|| {
        error_json(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "missing x-user-id header",
        )
    })?;

    let tenant_id = TenantId::parse(tenant_raw).map_err(|_| {
        error_json(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "invalid x-tenant-id header",
        )
    })?;
    let user_id = ActorId::parse(user_raw).map_err(|_| {
        error_json(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "invalid x-user-id header",
        )
    })?;

    Ok(TenantContext::new(
        tenant_id,
        user_id,
        header_str(headers, SESSION_HEADER).unwrap_or_default(),
        header_str(headers, ROLE_HEADER).unwrap_or_default(),
    ))
}

pub async fn rest_auth_middleware(
    axum::extract::State(auth_state): axum::extract::State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if skip_auth(request.uri().path()) {
        return next.run(request).await;
    }

    let ctx = match &auth_state.dev_context {
        Some(ctx) => ctx.clone(),
        None => match context_from_headers(request.headers()) {
            Ok(ctx) => ctx,
            Err(response) => {
                tracing::warn!(path = %request.uri().path(), "rejected unauthenticated request");
                return response;
            }
        },
    };

    tracing::debug!(
        tenant_id = %ctx.tenant_id,
        actor_id = %ctx.user_id,
        dev_mode = auth_state.is_dev_mode(),
        "request authenticated"
    );
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tenantgate_core::permission::{
    DenialReason, DenialRecord, PermissionRequirement, RequestInfo, evaluate,
};
use tenantgate_core::tenant::{ActorId, TenantContext, TenantId};
use tenantgate_storage::traits::CacheStore;

use crate::audit::{self, DenialSink, TracingDenialSink};
use crate::cache::AuthorizationCache;
use crate::error::AuthzError;
use crate::metrics::{AuthzMetrics, MetricsSnapshot};
use crate::resolver::{PermissionResolver, ResolvedPermissions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzDecision {
    pub allowed: bool,
    pub cache_hit: bool,
    pub permissions: HashSet<String>,
    pub roles: HashSet<String>,
    pub denial: Option<DenialRecord>,
}

pub struct AuthzService<S: CacheStore, R: PermissionResolver> {
    cache: AuthorizationCache<S>,
    resolver: Arc<R>,
    metrics: Arc<AuthzMetrics>,
    sink: Arc<dyn DenialSink>,
    production: bool,
}

impl<S: CacheStore, R: PermissionResolver> AuthzService<S, R> {
    pub fn new(cache: AuthorizationCache<S>, resolver: Arc<R>, metrics: Arc<AuthzMetrics>) -> Self {
        Self {
            cache,
            resolver,
            metrics,
            sink: Arc::new(TracingDenialSink),
            production: false,
        }
    }

    pub fn with_denial_sink(mut self, sink: Arc<dyn DenialSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn is_production(&self) -> bool {
        self.production
    }

    pub fn cache(&self) -> &AuthorizationCache<S> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<AuthzMetrics> {
        &self.metrics
    }

    /// Cached evaluation for the caller, falling back to the resolver.
    /// Returns the permissions and whether they came from the cache.
    pub async fn resolve_permissions(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
    ) -> Result<(ResolvedPermissions, bool), AuthzError> {
        if let Some(entry) = self.cache.get(tenant_id, actor_id).await {
            return Ok((
                ResolvedPermissions {
                    permissions: entry.permissions,
                    roles: entry.roles,
                },
                true,
            ));
        }

        let resolved = match self.resolver.resolve(tenant_id, actor_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, actor_id = %actor_id, error = %e, "permission resolution failed");
                self.metrics.record_error();
                return Err(e.into());
            }
        };
        self.cache
            .set(tenant_id, actor_id, &resolved.permissions, &resolved.roles)
            .await;
        Ok((resolved, false))
    }

    /// Decides whether the caller meets `requirement`. A denial is a normal
    /// outcome and is reported to the denial sink; only resolution and
    /// context failures are errors.
    pub async fn authorize(
        &self,
        ctx: &TenantContext,
        request: &RequestInfo,
        requirement: Option<&PermissionRequirement>,
    ) -> Result<AuthzDecision, AuthzError> {
        let requirement = match requirement {
            Some(req) if !req.permissions.is_empty() => req,
            _ => {
                self.metrics.record_error();
                let denial = DenialRecord::new(
                    request,
                    &ctx.tenant_id,
                    &ctx.user_id,
                    requirement,
                    &HashSet::new(),
                    DenialReason::MissingPermissionDeclaration,
                );
                self.sink.record_denial(&denial);
                return Ok(AuthzDecision {
                    allowed: false,
                    cache_hit: false,
                    permissions: HashSet::new(),
                    roles: HashSet::new(),
                    denial: Some(denial),
                });
            }
        };

        let start = Instant::now();
        let (resolved, cache_hit) = self.resolve_permissions(&ctx.tenant_id, &ctx.user_id).await?;

        let reason = if resolved.roles.is_empty() {
            Some(DenialReason::NoRoles)
        } else if evaluate(&resolved.permissions, requirement) {
            None
        } else {
            Some(DenialReason::InsufficientPermissions)
        };
        self.metrics.record_duration(start.elapsed(), cache_hit);

        let denial = reason.map(|reason| {
            DenialRecord::new(
                request,
                &ctx.tenant_id,
                &ctx.user_id,
                Some(requirement),
                &resolved.permissions,
                reason,
            )
        });
        if let Some(denial) = &denial {
            self.sink.record_denial(denial);
        }

        Ok(AuthzDecision {
            allowed: denial.is_none(),
            cache_hit,
            permissions: resolved.permissions,
            roles: resolved.roles,
            denial,
        })
    }

    /// Like [`AuthzService::authorize`], but a denial becomes
    /// [`AuthzError::Forbidden`].
    pub async fn require_permissions(
        &self,
        ctx: &TenantContext,
        request: &RequestInfo,
        requirement: Option<&PermissionRequirement>,
    ) -> Result<AuthzDecision, AuthzError> {
        let mut decision = self.authorize(ctx, request, requirement).await?;
        match decision.denial.take() {
            Some(denial) => Err(AuthzError::Forbidden(Box::new(denial))),
            None => Ok(decision),
        }
    }

    /// Runs `op` only if the caller meets `requirement`.
    pub async fn with_permissions<T, F, Fut>(
        &self,
        ctx: &TenantContext,
        request: &RequestInfo,
        requirement: Option<&PermissionRequirement>,
        op: F,
    ) -> Result<T, AuthzError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.require_permissions(ctx, request, requirement).await?;
        Ok(op().await)
    }

    pub async fn invalidate_abac_cache(
        &self,
        tenant_id: &TenantId,
        actor_id: Option<&ActorId>,
    ) -> Result<usize, AuthzError> {
        let removed = self.cache.invalidate(tenant_id, actor_id).await?;
        let scope = if actor_id.is_some() { "actor" } else { "tenant" };
        audit::audit_cache_invalidation(tenant_id, scope, removed);
        Ok(removed)
    }

    pub async fn invalidate_abac_cache_for_role(
        &self,
        tenant_id: &TenantId,
        role_id: &str,
    ) -> Result<usize, AuthzError> {
        let removed = self.cache.invalidate_for_role(tenant_id, role_id).await?;
        audit::audit_cache_invalidation(tenant_id, "role", removed);
        Ok(removed)
    }

    pub fn authorization_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_authorization_metrics(&self) {
        self.metrics.reset();
    }
}

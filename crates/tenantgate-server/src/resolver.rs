use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tenantgate_core::tenant::{ActorId, TenantId};
use tenantgate_storage::postgres::TenantPool;
use tenantgate_storage::traits::ContextError;

pub const DEFAULT_ROLES_QUERY: &str = "SELECT role FROM user_roles WHERE user_id = $1";
pub const DEFAULT_PERMISSIONS_QUERY: &str = "SELECT DISTINCT rp.permission \
     FROM role_permissions rp JOIN user_roles ur ON ur.role = rp.role \
     WHERE ur.user_id = $1";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedPermissions {
    pub permissions: HashSet<String>,
    pub roles: HashSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("tenant context error: {0}")]
    Context(#[from] ContextError),

    #[error("permission query failed: {0}")]
    Query(String),

    #[error("permission resolver unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative source of an actor's permissions, consulted on cache miss.
pub trait PermissionResolver: Send + Sync {
    fn resolve(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
    ) -> impl Future<Output = Result<ResolvedPermissions, ResolveError>> + Send;
}

/// Role grants held in memory, typically loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticPermissionResolver {
    roles: HashMap<String, HashSet<String>>,
    assignments: HashMap<(TenantId, ActorId), HashSet<String>>,
    calls: AtomicU64,
}

impl StaticPermissionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role<I, P>(mut self, role: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.roles
            .entry(role.into())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn assign(mut self, tenant_id: TenantId, actor_id: ActorId, role: impl Into<String>) -> Self {
        self.assignments
            .entry((tenant_id, actor_id))
            .or_default()
            .insert(role.into());
        self
    }

    /// Number of times [`PermissionResolver::resolve`] has been called.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl PermissionResolver for StaticPermissionResolver {
    async fn resolve(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
    ) -> Result<ResolvedPermissions, ResolveError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let roles = self
            .assignments
            .get(&(tenant_id.clone(), actor_id.clone()))
            .cloned()
            .unwrap_or_default();
        let permissions = roles
            .iter()
            .filter_map(|role| self.roles.get(role))
            .flatten()
            .cloned()
            .collect();

        Ok(ResolvedPermissions { permissions, roles })
    }
}

/// Resolves roles and permissions with tenant-scoped queries. Both queries
/// take the actor id as `$1`; row-level policies restrict rows to the tenant
/// bound on the connection.
#[derive(Debug, Clone)]
pub struct PgPermissionResolver {
    pool: TenantPool,
    roles_query: String,
    permissions_query: String,
}

impl PgPermissionResolver {
    pub fn new(pool: TenantPool) -> Self {
        Self::with_queries(pool, DEFAULT_ROLES_QUERY, DEFAULT_PERMISSIONS_QUERY)
    }

    pub fn with_queries(
        pool: TenantPool,
        roles_query: impl Into<String>,
        permissions_query: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            roles_query: roles_query.into(),
            permissions_query: permissions_query.into(),
        }
    }
}

impl PermissionResolver for PgPermissionResolver {
    async fn resolve(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
    ) -> Result<ResolvedPermissions, ResolveError> {
        let mut conn = self.pool.acquire().await.map_err(|e| match e {
            ContextError::Acquire(msg) => ResolveError::Unavailable(msg),
            other => ResolveError::Context(other),
        })?;

        let actor = *actor_id.as_uuid();
        let roles_query = self.roles_query.clone();
        let permissions_query = self.permissions_query.clone();

        let resolved = conn
            .run_with_context::<ResolvedPermissions, ResolveError, _>(tenant_id, move |c| {
                Box::pin(async move {
                    let roles: Vec<String> = sqlx::query_scalar(&roles_query)
                        .bind(actor)
                        .fetch_all(&mut **c)
                        .await
                        .map_err(|e| ResolveError::Query(e.to_string()))?;
                    let permissions: Vec<String> = sqlx::query_scalar(&permissions_query)
                        .bind(actor)
                        .fetch_all(&mut **c)
                        .await
                        .map_err(|e| ResolveError::Query(e.to_string()))?;

                    Ok(ResolvedPermissions {
                        permissions: permissions.into_iter().collect(),
                        roles: roles.into_iter().collect(),
                    })
                })
            })
            .await?;

        conn.release().await?;
        Ok(resolved)
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantgate_core::keyspace::{CATEGORY_ABAC, KeyOptions, Keyspace, KeyspaceError};
use tenantgate_core::tenant::{ActorId, TenantId};
use tenantgate_storage::traits::{CacheStore, StorageError};

use crate::metrics::AuthzMetrics;

pub const DEFAULT_POLICY_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEvaluation {
    pub permissions: HashSet<String>,
    pub roles: HashSet<String>,
    pub evaluated_at: DateTime<Utc>,
    pub policy_version: String,
}

/// Entry lifetime is not part of the settings; it comes from the keyspace's
/// ABAC category.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub policy_version: String,
    pub key_options: KeyOptions,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            policy_version: DEFAULT_POLICY_VERSION.to_string(),
            key_options: KeyOptions::default(),
        }
    }
}

/// Per-(tenant, actor) evaluation cache over a store shared by all tenants.
///
/// Every key is checked against the caller's tenant before the store is
/// touched. Store failures degrade to misses so callers recompute.
pub struct AuthorizationCache<S: CacheStore> {
    store: Arc<S>,
    keyspace: Arc<Keyspace>,
    settings: CacheSettings,
    metrics: Arc<AuthzMetrics>,
}

impl<S: CacheStore> AuthorizationCache<S> {
    pub fn new(
        store: Arc<S>,
        keyspace: Arc<Keyspace>,
        settings: CacheSettings,
        metrics: Arc<AuthzMetrics>,
    ) -> Self {
        Self {
            store,
            keyspace,
            settings,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn ttl(&self) -> Result<Duration, KeyspaceError> {
        self.keyspace.default_ttl(CATEGORY_ABAC)
    }

    pub fn key_for(&self, tenant_id: &TenantId, actor_id: &ActorId) -> Result<String, KeyspaceError> {
        self.keyspace.tenant_scoped_key(
            CATEGORY_ABAC,
            &actor_id.to_string(),
            &tenant_id.to_string(),
            &self.settings.key_options,
        )
    }

    pub async fn get(&self, tenant_id: &TenantId, actor_id: &ActorId) -> Option<CachedEvaluation> {
        let key = self.checked_key(tenant_id, actor_id)?;

        if let Err(e) = self.store.connect().await {
            log_unavailable(tenant_id, "get", &e);
            return None;
        }
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log_unavailable(tenant_id, "get", &e);
                return None;
            }
        };

        let entry: CachedEvaluation = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(tenant_id = %tenant_id, error = %e, "undecodable cache entry, treating as miss");
                self.metrics.record_error();
                return None;
            }
        };

        if entry.policy_version != self.settings.policy_version {
            tracing::debug!(
                tenant_id = %tenant_id,
                cached = %entry.policy_version,
                current = %self.settings.policy_version,
                "stale policy version, treating as miss"
            );
            return None;
        }
        Some(entry)
    }

    /// Returns whether the evaluation was written.
    pub async fn set(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
        permissions: &HashSet<String>,
        roles: &HashSet<String>,
    ) -> bool {
        let Some(key) = self.checked_key(tenant_id, actor_id) else {
            return false;
        };
        let ttl = match self.ttl() {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, error = %e, "no ttl registered for cache entries");
                self.metrics.record_error();
                return false;
            }
        };

        let entry = CachedEvaluation {
            permissions: permissions.clone(),
            roles: roles.clone(),
            evaluated_at: Utc::now(),
            policy_version: self.settings.policy_version.clone(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, error = %e, "failed to encode cache entry");
                self.metrics.record_error();
                return false;
            }
        };

        if let Err(e) = self.store.connect().await {
            log_unavailable(tenant_id, "set", &e);
            return false;
        }
        match self.store.set(&key, &raw, ttl).await {
            Ok(()) => true,
            Err(e) => {
                log_unavailable(tenant_id, "set", &e);
                false
            }
        }
    }

    /// Removes one actor's entry, or every entry of the tenant when `actor_id`
    /// is `None`. Returns how many entries were removed.
    pub async fn invalidate(
        &self,
        tenant_id: &TenantId,
        actor_id: Option<&ActorId>,
    ) -> Result<usize, StorageError> {
        self.store.connect().await?;

        if let Some(actor_id) = actor_id {
            let Some(key) = self.checked_key(tenant_id, actor_id) else {
                return Ok(0);
            };
            return Ok(usize::from(self.store.delete(&key).await?));
        }

        let pattern = self
            .keyspace
            .tenant_pattern(CATEGORY_ABAC, tenant_id, &self.settings.key_options)
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut removed = 0;
        for key in self.store.keys_matching(&pattern).await? {
            if !self.keyspace.validate_tenant_key(&key, tenant_id) {
                tracing::error!(
                    tenant_id = %tenant_id,
                    key = %key,
                    "pattern match returned a key outside the tenant, skipping"
                );
                self.metrics.record_error();
                continue;
            }
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Role membership is not tracked per entry, so a role change drops the
    /// whole tenant.
    pub async fn invalidate_for_role(
        &self,
        tenant_id: &TenantId,
        role_id: &str,
    ) -> Result<usize, StorageError> {
        tracing::debug!(tenant_id = %tenant_id, role_id = role_id, "invalidating tenant cache for role change");
        self.invalidate(tenant_id, None).await
    }

    fn checked_key(&self, tenant_id: &TenantId, actor_id: &ActorId) -> Option<String> {
        let key = match self.key_for(tenant_id, actor_id) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(tenant_id = %tenant_id, error = %e, "failed to build cache key");
                self.metrics.record_error();
                return None;
            }
        };
        if !self.keyspace.validate_tenant_key(&key, tenant_id) {
            tracing::error!(tenant_id = %tenant_id, key = %key, "cache key failed tenant validation");
            self.metrics.record_error();
            return None;
        }
        Some(key)
    }
}

fn log_unavailable(tenant_id: &TenantId, operation: &str, error: &StorageError) {
    tracing::warn!(
        tenant_id = %tenant_id,
        operation = operation,
        error = %error,
        "cache store unavailable, falling back to resolver"
    );
}

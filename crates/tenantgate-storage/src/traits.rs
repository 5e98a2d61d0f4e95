use std::future::Future;
use std::time::Duration;

use tenantgate_core::tenant::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Shared key/value store holding cached evaluations for every tenant.
///
/// Patterns passed to [`CacheStore::keys_matching`] are prefixes terminated by
/// a single `*`. Implementations may return more keys than asked for; callers
/// re-validate every key before acting on it.
pub trait CacheStore: Send + Sync {
    /// Idempotent; safe to call before every operation.
    fn connect(&self) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Returns whether a key was removed. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn keys_matching(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

/// Matches `key` against a prefix pattern (`prefix*`) or an exact key.
pub fn key_matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("tenant operation already active in this scope")]
    NestedTenantOperation,

    #[error("guarded scope belongs to tenant {scope}, refusing to bind tenant {requested}")]
    TenantMismatch { scope: TenantId, requested: TenantId },

    #[error("connection has already been released")]
    AlreadyReleased,

    #[error("failed to acquire connection: {0}")]
    Acquire(String),

    #[error("failed to bind tenant context: {0}")]
    BindFailed(String),

    #[error("failed to clear tenant context: {0}")]
    ClearFailed(String),

    #[error("transaction error: {0}")]
    Transaction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindScope {
    /// Lives until explicitly cleared; survives across statements.
    Session,
    /// Discarded by the database at the end of the current transaction.
    Transaction,
}

/// The only place that knows how a tenant id is attached to a connection.
pub trait ContextBinder: Send + 'static {
    fn bind_tenant(
        &mut self,
        tenant_id: &TenantId,
        scope: BindScope,
    ) -> impl Future<Output = Result<(), ContextError>> + Send;

    fn clear_tenant(
        &mut self,
        scope: BindScope,
    ) -> impl Future<Output = Result<(), ContextError>> + Send;

    fn begin(&mut self) -> impl Future<Output = Result<(), ContextError>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), ContextError>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), ContextError>> + Send;

    /// Makes sure the connection is never handed to another operation.
    fn discard(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

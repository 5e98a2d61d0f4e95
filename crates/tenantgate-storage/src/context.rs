use std::future::Future;
use std::pin::Pin;

use tenantgate_core::tenant::TenantId;

use crate::traits::{BindScope, ContextBinder, ContextError};

tokio::task_local! {
    static TENANT_SCOPE: TenantId;
}

/// Work executed against a connection while a tenant is bound to it.
pub type TenantOperation<'c, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound(TenantId),
    /// The scope that set the binding ended without clearing it (cancelled,
    /// panicked, or the clear itself failed).
    Abandoned(TenantId),
}

impl BindingState {
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            BindingState::Unbound => None,
            BindingState::Bound(t) | BindingState::Abandoned(t) => Some(t),
        }
    }
}

// Marks the binding abandoned if the owning future is dropped mid-operation.
struct AbandonOnDrop<'a> {
    state: &'a mut BindingState,
    armed: bool,
}

impl AbandonOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tenant_id = match &*self.state {
            BindingState::Bound(t) => t.clone(),
            _ => return,
        };
        tracing::warn!(
            tenant_id = %tenant_id,
            "tenant operation ended without clearing context"
        );
        *self.state = BindingState::Abandoned(tenant_id);
    }
}

/// A connection that carries at most one tenant binding at a time.
///
/// Every scoped operation clears the binding on exit. If the scope never gets
/// to run its exit path the binding is cleared before the connection is bound
/// again, and on drop the connection is either cleared or discarded.
pub struct TenantConnection<C: ContextBinder> {
    conn: Option<C>,
    state: BindingState,
    in_transaction: bool,
}

impl<C: ContextBinder> TenantConnection<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Some(conn),
            state: BindingState::Unbound,
            in_transaction: false,
        }
    }

    pub fn state(&self) -> &BindingState {
        &self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state.tenant().is_some()
    }

    /// Binds `tenant_id` for the rest of the session until
    /// [`TenantConnection::clear_context`] is called.
    pub async fn set_context(&mut self, tenant_id: &TenantId) -> Result<(), ContextError> {
        check_guarded_scope(tenant_id)?;
        self.prepare_for_bind(tenant_id).await?;

        let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
        // Until the bind is confirmed the setting may or may not be applied,
        // so a failure or a cancellation here must still be cleaned up.
        self.state = BindingState::Abandoned(tenant_id.clone());
        conn.bind_tenant(tenant_id, BindScope::Session).await?;
        self.state = BindingState::Bound(tenant_id.clone());
        Ok(())
    }

    /// Resets the session binding. Safe to call when nothing is bound.
    pub async fn clear_context(&mut self) -> Result<(), ContextError> {
        let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
        match conn.clear_tenant(BindScope::Session).await {
            Ok(()) => {
                self.state = BindingState::Unbound;
                Ok(())
            }
            Err(e) => {
                if let Some(tenant_id) = self.state.tenant().cloned() {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "failed to clear tenant context");
                    self.state = BindingState::Abandoned(tenant_id);
                }
                Err(e)
            }
        }
    }

    /// Binds the tenant, runs `op`, and clears the binding whatever `op`
    /// returned. A failed clear takes precedence over the operation's result.
    pub async fn run_with_context<T, E, F>(&mut self, tenant_id: &TenantId, op: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut C) -> TenantOperation<'c, T, E>,
        E: From<ContextError>,
    {
        self.set_context(tenant_id).await?;

        let outcome = {
            let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
            let pending = AbandonOnDrop {
                state: &mut self.state,
                armed: true,
            };
            let result = op(conn).await;
            pending.disarm();
            result
        };

        match (outcome, self.clear_context().await) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(_), Err(e)) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    "operation failed and its tenant context could not be cleared"
                );
                Err(e.into())
            }
        }
    }

    /// Like [`TenantConnection::run_with_context`], but inside a transaction
    /// with a transaction-local binding. Commits on success, rolls back on
    /// any error.
    pub async fn run_in_transaction<T, E, F>(
        &mut self,
        tenant_id: &TenantId,
        op: F,
    ) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut C) -> TenantOperation<'c, T, E>,
        E: From<ContextError>,
    {
        check_guarded_scope(tenant_id)?;
        self.prepare_for_bind(tenant_id).await?;

        let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
        self.in_transaction = true;
        self.state = BindingState::Abandoned(tenant_id.clone());
        if let Err(e) = conn.begin().await {
            self.in_transaction = false;
            self.state = BindingState::Unbound;
            return Err(e.into());
        }

        if let Err(e) = conn.bind_tenant(tenant_id, BindScope::Transaction).await {
            self.finish_with_rollback().await?;
            return Err(e.into());
        }
        self.state = BindingState::Bound(tenant_id.clone());

        let outcome = {
            let pending = AbandonOnDrop {
                state: &mut self.state,
                armed: true,
            };
            let result = op(conn).await;
            pending.disarm();
            result
        };

        match outcome {
            Ok(value) => {
                let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
                if let Err(e) = conn.clear_tenant(BindScope::Transaction).await {
                    self.finish_with_rollback().await?;
                    return Err(e.into());
                }
                let committed = conn.commit().await;
                // The transaction is over either way, and its local setting with it.
                self.in_transaction = false;
                self.state = BindingState::Unbound;
                committed?;
                Ok(value)
            }
            Err(err) => {
                self.finish_with_rollback().await?;
                Err(err)
            }
        }
    }

    /// Clears any binding and hands back the raw connection.
    pub async fn release(mut self) -> Result<C, ContextError> {
        let bound = self.is_bound();
        if self.in_transaction {
            self.finish_with_rollback().await?;
        }
        if bound {
            self.clear_context().await?;
        }
        self.conn.take().ok_or(ContextError::AlreadyReleased)
    }

    async fn prepare_for_bind(&mut self, tenant_id: &TenantId) -> Result<(), ContextError> {
        if let BindingState::Bound(active) = &self.state {
            tracing::error!(
                active_tenant = %active,
                requested_tenant = %tenant_id,
                "connection already bound, refusing nested tenant operation"
            );
            return Err(ContextError::NestedTenantOperation);
        }

        let stale = self.state.tenant().cloned();
        if self.in_transaction {
            tracing::warn!("rolling back transaction left open by an earlier operation");
            self.finish_with_rollback().await?;
        }
        if let Some(stale) = stale {
            tracing::warn!(
                stale_tenant = %stale,
                "clearing abandoned tenant binding before reuse"
            );
            // A session setting survives the rollback above.
            self.state = BindingState::Abandoned(stale);
            self.clear_context().await?;
        }
        Ok(())
    }

    async fn finish_with_rollback(&mut self) -> Result<(), ContextError> {
        let conn = self.conn.as_mut().ok_or(ContextError::AlreadyReleased)?;
        match conn.rollback().await {
            Ok(()) => {
                self.in_transaction = false;
                self.state = BindingState::Unbound;
                Ok(())
            }
            Err(e) => {
                if let Some(tenant_id) = self.state.tenant().cloned() {
                    self.state = BindingState::Abandoned(tenant_id);
                }
                tracing::error!(error = %e, "rollback failed, tenant connection left abandoned");
                Err(e)
            }
        }
    }
}

impl<C: ContextBinder> Drop for TenantConnection<C> {
    fn drop(&mut self) {
        let in_transaction = self.in_transaction;
        let tenant_id = match self.state.tenant() {
            Some(t) => t.to_string(),
            None if in_transaction => "-".to_string(),
            None => return,
        };
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    in_transaction,
                    "tenant connection dropped while bound, clearing in background"
                );
                handle.spawn(async move {
                    if in_transaction && conn.rollback().await.is_err() {
                        tracing::error!(tenant_id = %tenant_id, "rollback failed, discarding connection");
                        conn.discard();
                        return;
                    }
                    match conn.clear_tenant(BindScope::Session).await {
                        Ok(()) => drop(conn),
                        Err(e) => {
                            tracing::error!(
                                tenant_id = %tenant_id,
                                error = %e,
                                "failed to clear tenant context, discarding connection"
                            );
                            conn.discard();
                        }
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    "tenant connection dropped outside a runtime, discarding"
                );
                conn.discard();
            }
        }
    }
}

fn check_guarded_scope(tenant_id: &TenantId) -> Result<(), ContextError> {
    match current_tenant() {
        Some(scope) if scope != *tenant_id => {
            tracing::error!(
                scope_tenant = %scope,
                requested_tenant = %tenant_id,
                "tenant binding does not match guarded scope"
            );
            Err(ContextError::TenantMismatch {
                scope,
                requested: tenant_id.clone(),
            })
        }
        _ => Ok(()),
    }
}

/// Tenant of the enclosing [`guard`] scope, if any.
pub fn current_tenant() -> Option<TenantId> {
    TENANT_SCOPE.try_with(TenantId::clone).ok()
}

/// Runs `op` inside a scope that belongs to `tenant_id`.
///
/// Scopes do not nest: entering one while another is active on the same task
/// is refused before `op` is invoked.
pub async fn guard<T, F, Fut>(tenant_id: TenantId, op: F) -> Result<T, ContextError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    if let Some(active) = current_tenant() {
        tracing::error!(
            active_tenant = %active,
            requested_tenant = %tenant_id,
            "nested tenant operation rejected"
        );
        return Err(ContextError::NestedTenantOperation);
    }

    Ok(TENANT_SCOPE.scope(tenant_id, op()).await)
}

use tenantgate_core::permission::DenialRecord;
use tenantgate_core::tenant::TenantId;

/// Receives the full internal record of every denial.
pub trait DenialSink: Send + Sync {
    fn record_denial(&self, denial: &DenialRecord);
}

/// Emits denials as structured `audit` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDenialSink;

impl DenialSink for TracingDenialSink {
    fn record_denial(&self, denial: &DenialRecord) {
        audit_denial(denial);
    }
}

pub fn audit_denial(denial: &DenialRecord) {
    let required = denial.required.join(",");
    let granted = denial.granted.join(",");
    let evaluator = denial.evaluator.map(|e| e.as_str()).unwrap_or("none");

    if denial.reason.is_configuration_defect() {
        tracing::error!(
            target: "audit",
            event = "authz_denied",
            request_id = %denial.request_id,
            tenant_id = %denial.tenant_id,
            actor_id = %denial.actor_id,
            route = %denial.route,
            method = %denial.method,
            reason = denial.reason.as_str(),
            evaluator = evaluator,
            required = %required,
            granted = %granted,
            "protected route has no permission declaration"
        );
    } else {
        tracing::warn!(
            target: "audit",
            event = "authz_denied",
            request_id = %denial.request_id,
            tenant_id = %denial.tenant_id,
            actor_id = %denial.actor_id,
            route = %denial.route,
            method = %denial.method,
            reason = denial.reason.as_str(),
            evaluator = evaluator,
            required = %required,
            granted = %granted,
            "authorization denied"
        );
    }
}

pub fn audit_cache_invalidation(tenant_id: &TenantId, scope: &str, removed: usize) {
    tracing::info!(
        target: "audit",
        event = "authz_cache_invalidated",
        tenant_id = %tenant_id,
        scope = scope,
        removed = removed,
        "authorization cache invalidated"
    );
}

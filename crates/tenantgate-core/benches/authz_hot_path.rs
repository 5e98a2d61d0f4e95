use std::collections::HashSet;

use criterion::{Criterion, criterion_group, criterion_main};

use tenantgate_core::keyspace::{CATEGORY_ABAC, KeyOptions, Keyspace};
use tenantgate_core::permission::{Permission, PermissionRequirement, evaluate};
use tenantgate_core::tenant::TenantId;

fn actor_permissions(count: usize) -> HashSet<String> {
    (0..count).map(|i| format!("resource{i}:read")).collect()
}

fn requirement(count: usize) -> Vec<Permission> {
    (0..count)
        .map(|i| Permission::new(format!("resource{i}"), "read"))
        .collect()
}

fn bench_evaluate_all_of_5(c: &mut Criterion) {
    let granted = actor_permissions(50);
    let req = PermissionRequirement::all_of(requirement(5));

    c.bench_function("evaluate_all_of_5_of_50", |b| {
        b.iter(|| evaluate(&granted, &req));
    });
}

fn bench_evaluate_any_of_miss(c: &mut Criterion) {
    let granted = actor_permissions(200);
    let req = PermissionRequirement::any_of(
        (0..10).map(|i| Permission::new(format!("other{i}"), "write")),
    );

    c.bench_function("evaluate_any_of_10_miss_of_200", |b| {
        b.iter(|| evaluate(&granted, &req));
    });
}

fn bench_tenant_key_build_and_validate(c: &mut Criterion) {
    let keyspace = Keyspace::default();
    let tenant = TenantId::new(uuid::Uuid::new_v4());
    let tenant_raw = tenant.to_string();
    let actor = uuid::Uuid::new_v4().to_string();

    c.bench_function("tenant_key_build_and_validate", |b| {
        b.iter(|| {
            let key = keyspace
                .tenant_scoped_key(CATEGORY_ABAC, &actor, &tenant_raw, &KeyOptions::default())
                .unwrap();
            assert!(keyspace.validate_tenant_key(&key, &tenant));
        });
    });
}

criterion_group!(
    benches,
    bench_evaluate_all_of_5,
    bench_evaluate_any_of_miss,
    bench_tenant_key_build_and_validate,
);
criterion_main!(benches);

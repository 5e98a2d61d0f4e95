//! Namespaced cache keys.
//!
//! Every key has the shape
//!
//! ```text
//! v<version>:<namespace>:<category>:<tenant_id>:<resource>   tenant-scoped
//! v<version>:<namespace>:<category>:<resource>               global
//! ```
//!
//! A global key is only ever produced for a `category:resource` pair that is
//! on the category's allow-list. Parsing relies on the same allow-list to tell
//! the two shapes apart.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::tenant::TenantId;

pub const KEYSPACE_VERSION: u32 = 1;
pub const KEY_SEPARATOR: char = ':';
pub const MAX_KEY_LENGTH: usize = 256;
pub const DEFAULT_NAMESPACE: &str = "tenantgate";

pub const CATEGORY_ABAC: &str = "abac";
pub const CATEGORY_SESSION: &str = "session";
pub const CATEGORY_RATE_LIMIT: &str = "rate_limit";
pub const CATEGORY_CONFIG: &str = "config";

const FORBIDDEN_RESOURCE_CHARS: &[char] = &['*', '?', '[', ']'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyspaceError {
    #[error("cache key category '{0}' is not registered")]
    InvalidKeyCategory(String),

    #[error("invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error("global key '{category}:{resource}' is not on the allow-list")]
    GlobalKeyNotAllowed { category: String, resource: String },

    #[error("cache key is {length} bytes, exceeding the maximum of {max}")]
    KeyTooLong { length: usize, max: usize },

    #[error("invalid cache key resource: {0:?}")]
    InvalidResource(String),

    #[error("malformed cache key: {0}")]
    MalformedKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOptions {
    pub version: u32,
}

impl KeyOptions {
    pub fn with_version(version: u32) -> Self {
        Self { version }
    }
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            version: KEYSPACE_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySpec {
    pub default_ttl: Duration,
    pub global_resources: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub version: u32,
    pub namespace: String,
    pub category: String,
    pub tenant_id: Option<TenantId>,
    pub resource: String,
}

impl ParsedKey {
    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Keyspace {
    namespace: String,
    categories: BTreeMap<String, CategorySpec>,
    max_key_length: usize,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            categories: BTreeMap::new(),
            max_key_length: MAX_KEY_LENGTH,
        }
    }

    pub fn with_category(mut self, name: impl Into<String>, default_ttl: Duration) -> Self {
        self.categories.insert(
            name.into(),
            CategorySpec {
                default_ttl,
                global_resources: BTreeSet::new(),
            },
        );
        self
    }

    /// Adds `category:resource` to the global allow-list. Unknown categories
    /// are ignored; register the category first.
    pub fn allow_global(mut self, category: &str, resource: impl Into<String>) -> Self {
        if let Some(spec) = self.categories.get_mut(category) {
            spec.global_resources.insert(resource.into());
        }
        self
    }

    pub fn with_max_key_length(mut self, max: usize) -> Self {
        self.max_key_length = max;
        self
    }

    pub fn with_default_ttl(mut self, category: &str, ttl: Duration) -> Self {
        if let Some(spec) = self.categories.get_mut(category) {
            spec.default_ttl = ttl;
        }
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn default_ttl(&self, category: &str) -> Result<Duration, KeyspaceError> {
        Ok(self.category(category)?.default_ttl)
    }

    pub fn is_global_allowed(&self, category: &str, resource: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|spec| spec.global_resources.contains(resource))
    }

    pub fn tenant_scoped_key(
        &self,
        category: &str,
        resource: &str,
        tenant_id: &str,
        options: &KeyOptions,
    ) -> Result<String, KeyspaceError> {
        self.category(category)?;
        let tenant_id = TenantId::parse(tenant_id)
            .map_err(|_| KeyspaceError::InvalidTenantId(tenant_id.to_string()))?;
        validate_resource(resource, true)?;

        let key = format!(
            "{}{sep}{tenant_id}{sep}{resource}",
            self.prefix(category, options),
            sep = KEY_SEPARATOR
        );
        self.check_length(key)
    }

    pub fn global_key(
        &self,
        category: &str,
        resource: &str,
        options: &KeyOptions,
    ) -> Result<String, KeyspaceError> {
        self.category(category)?;
        validate_resource(resource, false)?;
        if !self.is_global_allowed(category, resource) {
            return Err(KeyspaceError::GlobalKeyNotAllowed {
                category: category.to_string(),
                resource: resource.to_string(),
            });
        }

        let key = format!(
            "{}{KEY_SEPARATOR}{resource}",
            self.prefix(category, options)
        );
        self.check_length(key)
    }

    /// Pattern matching every tenant-scoped key of `category` for one tenant.
    pub fn tenant_pattern(
        &self,
        category: &str,
        tenant_id: &TenantId,
        options: &KeyOptions,
    ) -> Result<String, KeyspaceError> {
        self.category(category)?;
        Ok(format!(
            "{}{KEY_SEPARATOR}{tenant_id}{KEY_SEPARATOR}*",
            self.prefix(category, options)
        ))
    }

    pub fn parse_key(&self, key: &str) -> Result<ParsedKey, KeyspaceError> {
        if key.len() > self.max_key_length {
            return Err(KeyspaceError::KeyTooLong {
                length: key.len(),
                max: self.max_key_length,
            });
        }

        let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        if segments.len() < 4 {
            return Err(KeyspaceError::MalformedKey(format!(
                "expected at least 4 segments, found {}",
                segments.len()
            )));
        }

        let version = segments[0]
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                KeyspaceError::MalformedKey(format!("bad version segment {:?}", segments[0]))
            })?;

        if segments[1] != self.namespace {
            return Err(KeyspaceError::MalformedKey(format!(
                "foreign namespace {:?}",
                segments[1]
            )));
        }

        let category = segments[2];
        self.category(category)?;

        let rest = &segments[3..];
        if rest.len() == 1 {
            let resource = rest[0];
            if !self.is_global_allowed(category, resource) {
                return Err(KeyspaceError::GlobalKeyNotAllowed {
                    category: category.to_string(),
                    resource: resource.to_string(),
                });
            }
            return Ok(ParsedKey {
                version,
                namespace: segments[1].to_string(),
                category: category.to_string(),
                tenant_id: None,
                resource: resource.to_string(),
            });
        }

        let tenant_id = TenantId::parse(rest[0])
            .map_err(|_| KeyspaceError::InvalidTenantId(rest[0].to_string()))?;
        let separator = KEY_SEPARATOR.to_string();
        let resource = rest[1..].join(separator.as_str());
        validate_resource(&resource, true)?;

        Ok(ParsedKey {
            version,
            namespace: segments[1].to_string(),
            category: category.to_string(),
            tenant_id: Some(tenant_id),
            resource,
        })
    }

    /// Fails closed: any parse error, a global key, or a different tenant
    /// yields `false`.
    pub fn validate_tenant_key(&self, key: &str, tenant_id: &TenantId) -> bool {
        match self.parse_key(key) {
            Ok(parsed) => parsed.tenant_id.as_ref() == Some(tenant_id),
            Err(_) => false,
        }
    }

    fn category(&self, name: &str) -> Result<&CategorySpec, KeyspaceError> {
        self.categories
            .get(name)
            .ok_or_else(|| KeyspaceError::InvalidKeyCategory(name.to_string()))
    }

    fn prefix(&self, category: &str, options: &KeyOptions) -> String {
        format!(
            "v{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{category}",
            options.version, self.namespace
        )
    }

    fn check_length(&self, key: String) -> Result<String, KeyspaceError> {
        if key.len() > self.max_key_length {
            return Err(KeyspaceError::KeyTooLong {
                length: key.len(),
                max: self.max_key_length,
            });
        }
        Ok(key)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Keyspace::new(DEFAULT_NAMESPACE)
            .with_category(CATEGORY_ABAC, Duration::from_secs(30))
            .with_category(CATEGORY_SESSION, Duration::from_secs(15 * 60))
            .with_category(CATEGORY_RATE_LIMIT, Duration::from_secs(60))
            .with_category(CATEGORY_CONFIG, Duration::from_secs(5 * 60))
            .allow_global(CATEGORY_CONFIG, "feature_flags")
            .allow_global(CATEGORY_CONFIG, "maintenance")
    }
}

fn validate_resource(resource: &str, allow_separator: bool) -> Result<(), KeyspaceError> {
    let invalid = resource.is_empty()
        || resource.chars().any(char::is_whitespace)
        || resource.contains(FORBIDDEN_RESOURCE_CHARS)
        || (!allow_separator && resource.contains(KEY_SEPARATOR))
        || resource.split(KEY_SEPARATOR).any(str::is_empty);
    if invalid {
        return Err(KeyspaceError::InvalidResource(resource.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT_A: &str = "6f1c2a4e-2b7d-4c1e-9a3f-0d5e8b7c6a21";
    const TENANT_B: &str = "0a9b8c7d-6e5f-4a3b-8c2d-1e0f9a8b7c6d";

    fn keyspace() -> Keyspace {
        Keyspace::default()
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    // --- tenant_scoped_key ---

    #[test]
    fn tenant_scoped_key_has_versioned_layout() {
        let key = keyspace()
            .tenant_scoped_key(CATEGORY_ABAC, "user-1", TENANT_A, &KeyOptions::default())
            .unwrap();

        assert_eq!(key, format!("v1:tenantgate:abac:{TENANT_A}:user-1"));
    }

    #[test]
    fn tenant_scoped_key_honors_version_option() {
        let key = keyspace()
            .tenant_scoped_key(
                CATEGORY_ABAC,
                "user-1",
                TENANT_A,
                &KeyOptions::with_version(2),
            )
            .unwrap();

        assert!(key.starts_with("v2:tenantgate:abac:"), "got {key}");
    }

    #[test]
    fn tenant_scoped_key_rejects_unregistered_category() {
        let result =
            keyspace().tenant_scoped_key("bogus", "user-1", TENANT_A, &KeyOptions::default());

        assert_eq!(
            result,
            Err(KeyspaceError::InvalidKeyCategory("bogus".to_string()))
        );
    }

    #[test]
    fn tenant_scoped_key_rejects_invalid_tenant_id() {
        for bad in ["", "tenant-a", "6F1C2A4E-2B7D-4C1E-9A3F-0D5E8B7C6A21", "*"] {
            let result =
                keyspace().tenant_scoped_key(CATEGORY_ABAC, "user-1", bad, &KeyOptions::default());
            assert!(
                matches!(result, Err(KeyspaceError::InvalidTenantId(_))),
                "expected InvalidTenantId for {bad:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn tenant_scoped_key_rejects_glob_characters_in_resource() {
        for bad in ["*", "user-?", "user[1]", "", "has space", "a::b"] {
            let result =
                keyspace().tenant_scoped_key(CATEGORY_ABAC, bad, TENANT_A, &KeyOptions::default());
            assert!(
                matches!(result, Err(KeyspaceError::InvalidResource(_))),
                "expected InvalidResource for {bad:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn tenant_scoped_key_rejects_overlong_key_instead_of_truncating() {
        let resource = "r".repeat(MAX_KEY_LENGTH);
        let result =
            keyspace().tenant_scoped_key(CATEGORY_ABAC, &resource, TENANT_A, &KeyOptions::default());

        assert!(matches!(
            result,
            Err(KeyspaceError::KeyTooLong { max: MAX_KEY_LENGTH, .. })
        ));
    }

    #[test]
    fn custom_max_key_length_is_enforced() {
        let ks = keyspace().with_max_key_length(40);
        let result = ks.tenant_scoped_key(CATEGORY_ABAC, "user-1", TENANT_A, &KeyOptions::default());

        assert!(matches!(result, Err(KeyspaceError::KeyTooLong { max: 40, .. })));
    }

    // --- global_key ---

    #[test]
    fn global_key_allowed_pair_builds() {
        let key = keyspace()
            .global_key(CATEGORY_CONFIG, "feature_flags", &KeyOptions::default())
            .unwrap();

        assert_eq!(key, "v1:tenantgate:config:feature_flags");
    }

    #[test]
    fn global_key_rejects_every_category_without_allow_list() {
        let ks = keyspace();
        for category in [CATEGORY_ABAC, CATEGORY_SESSION, CATEGORY_RATE_LIMIT] {
            for resource in ["feature_flags", "anything", "user-1"] {
                let result = ks.global_key(category, resource, &KeyOptions::default());
                assert!(
                    matches!(result, Err(KeyspaceError::GlobalKeyNotAllowed { .. })),
                    "expected GlobalKeyNotAllowed for {category}:{resource}, got {result:?}"
                );
            }
        }
    }

    #[test]
    fn global_key_rejects_unlisted_resource_in_listed_category() {
        let result = keyspace().global_key(CATEGORY_CONFIG, "secrets", &KeyOptions::default());

        assert_eq!(
            result,
            Err(KeyspaceError::GlobalKeyNotAllowed {
                category: "config".to_string(),
                resource: "secrets".to_string(),
            })
        );
    }

    #[test]
    fn global_key_rejects_unregistered_category() {
        let result = keyspace().global_key("bogus", "feature_flags", &KeyOptions::default());
        assert!(matches!(result, Err(KeyspaceError::InvalidKeyCategory(_))));
    }

    // --- parse_key ---

    #[test]
    fn parse_key_round_trips_tenant_scoped_key() {
        let ks = keyspace();
        for resource in ["user-1", "a:b:c", "feature_flags"] {
            let key = ks
                .tenant_scoped_key(CATEGORY_ABAC, resource, TENANT_A, &KeyOptions::default())
                .unwrap();
            let parsed = ks.parse_key(&key).unwrap();

            assert_eq!(parsed.version, KEYSPACE_VERSION);
            assert_eq!(parsed.namespace, DEFAULT_NAMESPACE);
            assert_eq!(parsed.category, CATEGORY_ABAC);
            assert_eq!(parsed.tenant_id, Some(tenant(TENANT_A)));
            assert_eq!(parsed.resource, resource);
        }
    }

    #[test]
    fn parse_key_round_trips_global_key() {
        let ks = keyspace();
        let key = ks
            .global_key(CATEGORY_CONFIG, "maintenance", &KeyOptions::default())
            .unwrap();
        let parsed = ks.parse_key(&key).unwrap();

        assert!(parsed.is_global());
        assert_eq!(parsed.category, CATEGORY_CONFIG);
        assert_eq!(parsed.resource, "maintenance");
    }

    #[test]
    fn parse_key_distinguishes_tenant_key_named_like_global_resource() {
        let ks = keyspace();
        let key = ks
            .tenant_scoped_key(CATEGORY_CONFIG, "feature_flags", TENANT_A, &KeyOptions::default())
            .unwrap();
        let parsed = ks.parse_key(&key).unwrap();

        assert!(!parsed.is_global());
        assert_eq!(parsed.tenant_id, Some(tenant(TENANT_A)));
    }

    #[test]
    fn parse_key_rejects_malformed_input() {
        let ks = keyspace();
        for bad in [
            "",
            "v1:tenantgate:abac",
            "x1:tenantgate:abac:feature_flags",
            "v1:other:abac:6f1c2a4e-2b7d-4c1e-9a3f-0d5e8b7c6a21:user-1",
            "v1:tenantgate:abac:not-a-tenant:user-1",
            "v1:tenantgate:abac:unlisted",
        ] {
            assert!(ks.parse_key(bad).is_err(), "expected error for {bad:?}");
        }
    }

    // --- validate_tenant_key ---

    #[test]
    fn validate_tenant_key_accepts_owner_and_rejects_other_tenant() {
        let ks = keyspace();
        let key = ks
            .tenant_scoped_key(CATEGORY_ABAC, "user-1", TENANT_A, &KeyOptions::default())
            .unwrap();

        assert!(ks.validate_tenant_key(&key, &tenant(TENANT_A)));
        assert!(!ks.validate_tenant_key(&key, &tenant(TENANT_B)));
    }

    #[test]
    fn validate_tenant_key_fails_closed_on_global_and_garbage() {
        let ks = keyspace();
        let global = ks
            .global_key(CATEGORY_CONFIG, "feature_flags", &KeyOptions::default())
            .unwrap();

        assert!(!ks.validate_tenant_key(&global, &tenant(TENANT_A)));
        assert!(!ks.validate_tenant_key("garbage", &tenant(TENANT_A)));
        assert!(!ks.validate_tenant_key("", &tenant(TENANT_A)));
    }

    #[test]
    fn validate_tenant_key_holds_for_many_tenants() {
        let ks = keyspace();
        let tenants: Vec<TenantId> = (0..20)
            .map(|_| TenantId::new(uuid::Uuid::new_v4()))
            .collect();

        for (i, t) in tenants.iter().enumerate() {
            let key = ks
                .tenant_scoped_key(CATEGORY_ABAC, "actor", &t.to_string(), &KeyOptions::default())
                .unwrap();
            for (j, other) in tenants.iter().enumerate() {
                assert_eq!(ks.validate_tenant_key(&key, other), i == j);
            }
        }
    }

    // --- tenant_pattern / ttl ---

    #[test]
    fn tenant_pattern_is_prefix_of_every_tenant_key() {
        let ks = keyspace();
        let pattern = ks
            .tenant_pattern(CATEGORY_ABAC, &tenant(TENANT_A), &KeyOptions::default())
            .unwrap();
        let key = ks
            .tenant_scoped_key(CATEGORY_ABAC, "user-1", TENANT_A, &KeyOptions::default())
            .unwrap();

        let prefix = pattern.strip_suffix('*').unwrap();
        assert!(key.starts_with(prefix));
        assert!(prefix.ends_with(':'));
    }

    #[test]
    fn default_ttls_are_registered() {
        let ks = keyspace();
        assert_eq!(ks.default_ttl(CATEGORY_ABAC).unwrap(), Duration::from_secs(30));
        assert!(ks.default_ttl("bogus").is_err());

        let ks = ks.with_default_ttl(CATEGORY_ABAC, Duration::from_secs(5));
        assert_eq!(ks.default_ttl(CATEGORY_ABAC).unwrap(), Duration::from_secs(5));
    }
}

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use tenantgate_core::keyspace::{CATEGORY_ABAC, Keyspace};
use tenantgate_core::tenant::{ActorId, TenantId};

use crate::cache::{CacheSettings, DEFAULT_POLICY_VERSION};
use crate::metrics::MetricsConfig;
use crate::resolver::{DEFAULT_PERMISSIONS_QUERY, DEFAULT_ROLES_QUERY, StaticPermissionResolver};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rest: RestConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub authz: AuthzConfig,
    pub auth: AuthConfig,
    pub resolver: ResolverConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStoreKind {
    Memory,
    #[default]
    Moka,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub store: CacheStoreKind,
    pub abac_ttl_secs: u64,
    pub max_capacity: u64,
    pub policy_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    pub production: bool,
    pub p99_target_ms: f64,
    pub slow_threshold_ms: f64,
    pub histogram_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Dev,
    TrustedHeaders,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub dev_tenant_id: String,
    pub dev_user_id: String,
    pub dev_role: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    #[default]
    Static,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleAssignment {
    pub tenant_id: String,
    pub actor_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub kind: ResolverKind,
    pub roles: Vec<RoleDefinition>,
    pub assignments: Vec<RoleAssignment>,
    pub roles_query: String,
    pub permissions_query: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/tenantgate".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: CacheStoreKind::Moka,
            abac_ttl_secs: 30,
            max_capacity: 100_000,
            policy_version: DEFAULT_POLICY_VERSION.to_string(),
        }
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        let metrics = MetricsConfig::default();
        Self {
            production: false,
            p99_target_ms: metrics.p99_target_ms,
            slow_threshold_ms: metrics.slow_threshold_ms,
            histogram_capacity: metrics.histogram_capacity,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        let nil = uuid::Uuid::nil().to_string();
        Self {
            mode: AuthMode::Dev,
            dev_tenant_id: nil.clone(),
            dev_user_id: nil,
            dev_role: "admin".to_string(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            kind: ResolverKind::Static,
            roles: Vec::new(),
            assignments: Vec::new(),
            roles_query: DEFAULT_ROLES_QUERY.to_string(),
            permissions_query: DEFAULT_PERMISSIONS_QUERY.to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TENANTGATE_REST_HOST") {
            self.rest.host = v;
        }
        if let Ok(v) = std::env::var("TENANTGATE_REST_PORT")
            && let Ok(port) = v.parse()
        {
            self.rest.port = port;
        }
        if let Ok(v) = std::env::var("TENANTGATE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("TENANTGATE_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("TENANTGATE_CACHE_ABAC_TTL_SECS")
            && let Ok(n) = v.parse()
        {
            self.cache.abac_ttl_secs = n;
        }
        if let Ok(v) = std::env::var("TENANTGATE_CACHE_POLICY_VERSION") {
            self.cache.policy_version = v;
        }
        if let Ok(v) = std::env::var("TENANTGATE_AUTHZ_PRODUCTION")
            && let Ok(b) = v.parse()
        {
            self.authz.production = b;
        }
        if let Ok(v) = std::env::var("TENANTGATE_AUTH_MODE") {
            match v.as_str() {
                "dev" => self.auth.mode = AuthMode::Dev,
                "trusted_headers" => self.auth.mode = AuthMode::TrustedHeaders,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("TENANTGATE_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("TENANTGATE_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rest.port == 0 {
            return Err(ConfigError::Validation(
                "rest.port must be non-zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        if self.cache.abac_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "cache.abac_ttl_secs must be non-zero".to_string(),
            ));
        }
        if self.cache.policy_version.is_empty() {
            return Err(ConfigError::Validation(
                "cache.policy_version must not be empty".to_string(),
            ));
        }
        if self.authz.histogram_capacity == 0 {
            return Err(ConfigError::Validation(
                "authz.histogram_capacity must be non-zero".to_string(),
            ));
        }
        if !(self.authz.p99_target_ms.is_finite() && self.authz.p99_target_ms > 0.0) {
            return Err(ConfigError::Validation(
                "authz.p99_target_ms must be a positive number".to_string(),
            ));
        }
        if !self.authz.slow_threshold_ms.is_finite()
            || self.authz.slow_threshold_ms < self.authz.p99_target_ms
        {
            return Err(ConfigError::Validation(
                "authz.slow_threshold_ms must not be below authz.p99_target_ms".to_string(),
            ));
        }
        if self.auth.mode == AuthMode::Dev {
            TenantId::parse(&self.auth.dev_tenant_id).map_err(|_| {
                ConfigError::Validation("auth.dev_tenant_id must be a canonical UUID".to_string())
            })?;
            ActorId::parse(&self.auth.dev_user_id).map_err(|_| {
                ConfigError::Validation("auth.dev_user_id must be a canonical UUID".to_string())
            })?;
        }
        if self.resolver.kind == ResolverKind::Postgres
            && (self.resolver.roles_query.trim().is_empty()
                || self.resolver.permissions_query.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "postgres resolver requires resolver.roles_query and resolver.permissions_query"
                    .to_string(),
            ));
        }
        for assignment in &self.resolver.assignments {
            parse_assignment(assignment)?;
        }
        Ok(())
    }

    pub fn rest_addr(&self) -> String {
        format!("{}:{}", self.rest.host, self.rest.port)
    }

    pub fn abac_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.abac_ttl_secs)
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace::default().with_default_ttl(CATEGORY_ABAC, self.abac_ttl())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            policy_version: self.cache.policy_version.clone(),
            ..CacheSettings::default()
        }
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            histogram_capacity: self.authz.histogram_capacity,
            p99_target_ms: self.authz.p99_target_ms,
            slow_threshold_ms: self.authz.slow_threshold_ms,
        }
    }

    pub fn static_resolver(&self) -> Result<StaticPermissionResolver, ConfigError> {
        let mut resolver = StaticPermissionResolver::new();
        for role in &self.resolver.roles {
            resolver = resolver.with_role(role.name.clone(), role.permissions.iter().cloned());
        }
        for assignment in &self.resolver.assignments {
            let (tenant_id, actor_id) = parse_assignment(assignment)?;
            for role in &assignment.roles {
                resolver = resolver.assign(tenant_id.clone(), actor_id.clone(), role.clone());
            }
        }
        Ok(resolver)
    }
}

fn parse_assignment(assignment: &RoleAssignment) -> Result<(TenantId, ActorId), ConfigError> {
    let tenant_id = TenantId::parse(&assignment.tenant_id).map_err(|_| {
        ConfigError::Validation(format!(
            "resolver assignment has invalid tenant_id {:?}",
            assignment.tenant_id
        ))
    })?;
    let actor_id = ActorId::parse(&assignment.actor_id).map_err(|_| {
        ConfigError::Validation(format!(
            "resolver assignment has invalid actor_id {:?}",
            assignment.actor_id
        ))
    })?;
    Ok((tenant_id, actor_id))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tenant::{ActorId, TenantId};

pub const PERMISSION_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("permission must have the form 'resource:action', got {0:?}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PermissionError> {
        let (resource, action) = raw
            .split_once(PERMISSION_SEPARATOR)
            .ok_or_else(|| PermissionError::InvalidFormat(raw.to_string()))?;
        let valid = !resource.is_empty()
            && !action.is_empty()
            && !action.contains(PERMISSION_SEPARATOR)
            && !raw.chars().any(char::is_whitespace);
        if !valid {
            return Err(PermissionError::InvalidFormat(raw.to_string()));
        }
        Ok(Self::new(resource, action))
    }

    /// The `resource:action` string actors are granted.
    pub fn canonical(&self) -> String {
        format!("{}{PERMISSION_SEPARATOR}{}", self.resource, self.action)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{PERMISSION_SEPARATOR}{}", self.resource, self.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Evaluator {
    #[serde(rename = "allOf")]
    AllOf,
    #[serde(rename = "anyOf")]
    AnyOf,
}

impl Evaluator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Evaluator::AllOf => "allOf",
            Evaluator::AnyOf => "anyOf",
        }
    }
}

impl fmt::Display for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequirement {
    pub permissions: Vec<Permission>,
    pub evaluator: Evaluator,
}

impl PermissionRequirement {
    pub fn all_of(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            permissions: permissions.into_iter().collect(),
            evaluator: Evaluator::AllOf,
        }
    }

    pub fn any_of(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            permissions: permissions.into_iter().collect(),
            evaluator: Evaluator::AnyOf,
        }
    }

    pub fn canonical(&self) -> Vec<String> {
        self.permissions.iter().map(Permission::canonical).collect()
    }
}

/// Decides whether `actor_permissions` satisfy `requirement`.
///
/// A requirement with no permissions never grants.
pub fn evaluate(actor_permissions: &HashSet<String>, requirement: &PermissionRequirement) -> bool {
    if requirement.permissions.is_empty() {
        return false;
    }
    let mut held = requirement
        .permissions
        .iter()
        .map(|p| actor_permissions.contains(&p.canonical()));
    match requirement.evaluator {
        Evaluator::AllOf => held.all(|h| h),
        Evaluator::AnyOf => held.any(|h| h),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    InsufficientPermissions,
    MissingPermissionDeclaration,
    NoRoles,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::InsufficientPermissions => "insufficient_permissions",
            DenialReason::MissingPermissionDeclaration => "missing_permission_declaration",
            DenialReason::NoRoles => "no_roles",
        }
    }

    /// Configuration defects, as opposed to ordinary negative decisions.
    pub fn is_configuration_defect(&self) -> bool {
        matches!(self, DenialReason::MissingPermissionDeclaration)
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the request being authorized, carried into denial records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: String,
    pub route: String,
    pub method: String,
}

impl RequestInfo {
    pub fn new(
        request_id: impl Into<String>,
        route: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            route: route.into(),
            method: method.into(),
        }
    }
}

/// Full internal record of a denial. Never returned to callers as-is; see
/// [`DenialRecord::public_view`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenialRecord {
    pub request_id: String,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub route: String,
    pub method: String,
    pub required: Vec<String>,
    pub granted: Vec<String>,
    pub evaluator: Option<Evaluator>,
    pub reason: DenialReason,
}

impl DenialRecord {
    pub fn new(
        request: &RequestInfo,
        tenant_id: &TenantId,
        actor_id: &ActorId,
        requirement: Option<&PermissionRequirement>,
        granted: &HashSet<String>,
        reason: DenialReason,
    ) -> Self {
        let granted: BTreeSet<&String> = granted.iter().collect();
        Self {
            request_id: request.request_id.clone(),
            tenant_id: tenant_id.clone(),
            actor_id: actor_id.clone(),
            route: request.route.clone(),
            method: request.method.clone(),
            required: requirement
                .map(PermissionRequirement::canonical)
                .unwrap_or_default(),
            granted: granted.into_iter().cloned().collect(),
            evaluator: requirement.map(|r| r.evaluator),
            reason,
        }
    }

    pub fn public_view(&self, production: bool) -> PublicDenial {
        if production {
            return PublicDenial {
                message: "insufficient permissions".to_string(),
                reason: None,
                required: None,
                granted: None,
                evaluator: None,
            };
        }
        PublicDenial {
            message: "insufficient permissions".to_string(),
            reason: Some(self.reason),
            required: Some(self.required.clone()),
            granted: Some(self.granted.clone()),
            evaluator: self.evaluator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicDenial {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<Evaluator>,
}

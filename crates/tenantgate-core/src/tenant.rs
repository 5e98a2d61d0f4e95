use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Parses a canonical (lowercase, hyphenated) UUID.
///
/// Uppercase or braced spellings are rejected so that one identifier can only
/// ever be written one way inside cache keys and session settings.
fn parse_canonical_uuid(raw: &str) -> Result<Uuid, InvalidIdentifier> {
    let uuid = Uuid::try_parse(raw).map_err(|_| InvalidIdentifier(raw.to_string()))?;
    if uuid.hyphenated().to_string() != raw {
        return Err(InvalidIdentifier(raw.to_string()));
    }
    Ok(uuid)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidIdentifier> {
        parse_canonical_uuid(raw).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidIdentifier> {
        parse_canonical_uuid(raw).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ActorId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl TryFrom<String> for ActorId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Verified identity of the caller, built once per authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub user_id: ActorId,
    pub session_id: String,
    pub role: String,
}

impl TenantContext {
    pub fn new(
        tenant_id: TenantId,
        user_id: ActorId,
        session_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            user_id,
            session_id: session_id.into(),
            role: role.into(),
        }
    }
}

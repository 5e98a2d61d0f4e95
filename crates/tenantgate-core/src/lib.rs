pub mod keyspace;
pub mod permission;
pub mod tenant;

pub use keyspace::{KeyOptions, Keyspace, KeyspaceError, ParsedKey};
pub use permission::{
    DenialReason, DenialRecord, Evaluator, Permission, PermissionRequirement, PublicDenial,
    RequestInfo, evaluate,
};
pub use tenant::{ActorId, TenantContext, TenantId};

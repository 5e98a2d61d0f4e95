pub mod context;
pub mod memory;
pub mod moka_store;
pub mod postgres;
pub mod traits;

pub use context::{BindingState, TenantConnection, TenantOperation, current_tenant, guard};
pub use memory::{InMemoryCacheStore, InMemoryConnection};
pub use moka_store::MokaCacheStore;
pub use postgres::{TENANT_SETTING, TenantPool, tenant_pool_options};
pub use traits::{BindScope, CacheStore, ContextBinder, ContextError, StorageError};

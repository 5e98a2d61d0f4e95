use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tenantgate_core::tenant::TenantId;
use tokio::time::Instant;

use crate::traits::{
    BindScope, CacheStore, ContextBinder, ContextError, StorageError, key_matches_pattern,
};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local cache store with per-entry expiry.
///
/// Availability can be toggled so callers can exercise their degraded paths.
#[derive(Debug)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    connects: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            connects: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Number of entries that have not yet expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes a raw value, bypassing any key discipline. Used to simulate a
    /// shared store that already holds foreign entries.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.get(key).is_some_and(|e| e.is_live(now))
    }

    /// Number of entries held, expired or not.
    pub fn stored_entries(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryCacheStore {
    async fn connect(&self) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.remove(key).is_some())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.is_live(now));

        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key_matches_pattern(key, pattern))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    session_tenant: Option<TenantId>,
    // Some(None) means the transaction-local value was explicitly reset.
    local_tenant: Option<Option<TenantId>>,
    in_transaction: bool,
    commits: u32,
    rollbacks: u32,
    discarded: bool,
    fail_bind: bool,
    fail_clear: bool,
    events: Vec<String>,
}

/// Connection double that behaves like a session with one tenant setting.
///
/// Clones share state, so a test can keep a clone as a probe after handing
/// the connection itself to a [`crate::context::TenantConnection`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnection {
    state: Arc<Mutex<ConnectionState>>,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tenant the next statement would see.
    pub fn current_tenant(&self) -> Option<TenantId> {
        let state = self.state.lock().unwrap();
        match &state.local_tenant {
            Some(local) => local.clone(),
            None => state.session_tenant.clone(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }

    pub fn commits(&self) -> u32 {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().unwrap().rollbacks
    }

    pub fn is_discarded(&self) -> bool {
        self.state.lock().unwrap().discarded
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn fail_bind(&self, fail: bool) {
        self.state.lock().unwrap().fail_bind = fail;
    }

    pub fn fail_clear(&self, fail: bool) {
        self.state.lock().unwrap().fail_clear = fail;
    }

    /// Records an operation executed while a tenant is bound.
    pub fn record_query(&self, label: &str) -> Option<TenantId> {
        let tenant = self.current_tenant();
        let mut state = self.state.lock().unwrap();
        let seen = tenant
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        state.events.push(format!("query:{label}:{seen}"));
        tenant
    }
}

impl ContextBinder for InMemoryConnection {
    async fn bind_tenant(
        &mut self,
        tenant_id: &TenantId,
        scope: BindScope,
    ) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_bind {
            return Err(ContextError::BindFailed("simulated bind failure".to_string()));
        }

        match scope {
            BindScope::Session => state.session_tenant = Some(tenant_id.clone()),
            BindScope::Transaction => {
                if !state.in_transaction {
                    return Err(ContextError::Transaction(
                        "no transaction in progress".to_string(),
                    ));
                }
                state.local_tenant = Some(Some(tenant_id.clone()));
            }
        }
        state.events.push(format!("bind:{tenant_id}"));
        Ok(())
    }

    async fn clear_tenant(&mut self, scope: BindScope) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_clear {
            return Err(ContextError::ClearFailed(
                "simulated clear failure".to_string(),
            ));
        }

        match scope {
            BindScope::Session => {
                state.session_tenant = None;
                if state.in_transaction {
                    state.local_tenant = Some(None);
                }
            }
            BindScope::Transaction => {
                if !state.in_transaction {
                    return Err(ContextError::Transaction(
                        "no transaction in progress".to_string(),
                    ));
                }
                state.local_tenant = Some(None);
            }
        }
        state.events.push("clear".to_string());
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        if state.in_transaction {
            return Err(ContextError::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        state.in_transaction = true;
        state.events.push("begin".to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        if !state.in_transaction {
            return Err(ContextError::Transaction(
                "no transaction in progress".to_string(),
            ));
        }
        state.in_transaction = false;
        state.local_tenant = None;
        state.commits += 1;
        state.events.push("commit".to_string());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        if !state.in_transaction {
            return Ok(());
        }
        state.in_transaction = false;
        state.local_tenant = None;
        state.rollbacks += 1;
        state.events.push("rollback".to_string());
        Ok(())
    }

    fn discard(self) {
        let mut state = self.state.lock().unwrap();
        state.discarded = true;
        state.events.push("discard".to_string());
    }
}

//! Table of live client instances.
//!
//! [`ClientRegistry::global`] is the process-wide table, created on first
//! use. Code that wants isolation (tests, several independent embeddings in
//! one process) makes its own with [`ClientRegistry::new`].
//!
//! A handle is registered by [`ClientHandle::create`] and removed by
//! [`ClientHandle::destroy`] or when its receive loop ends. Call
//! [`ClientRegistry::shutdown_all`] before the process exits to close every
//! instance cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::handle::ClientHandle;

struct RegistryInner {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

/// Live client handles keyed by instance id. Cheap to clone.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

static GLOBAL: OnceLock<ClientRegistry> = OnceLock::new();

impl ClientRegistry {
    /// An empty registry, independent of the global one.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static ClientRegistry {
        GLOBAL.get_or_init(ClientRegistry::new)
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, handle: ClientHandle) {
        let id = handle.id();
        if self.inner.clients.lock().insert(id, handle).is_some() {
            tracing::warn!("[tdhead] Client {id} registered twice");
        }
    }

    pub(crate) fn remove(&self, id: u64) -> Option<ClientHandle> {
        let removed = self.inner.clients.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!("[tdhead] Client {id} unregistered");
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<ClientHandle> {
        self.inner.clients.lock().get(&id).cloned()
    }

    /// Registered ids, ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.clients.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every registered handle concurrently.
    pub async fn shutdown_all(&self) {
        let handles: Vec<ClientHandle> = self.inner.clients.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!("[tdhead] Shutting down {} client(s)", handles.len());
        let mut set = JoinSet::new();
        for handle in handles {
            set.spawn(async move { handle.destroy().await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("[tdhead] Client shutdown task failed: {e}");
            }
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_allocated_monotonically() {
        let registry = ClientRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
        assert!(registry.is_empty());
        assert!(registry.get(a).is_none());
    }

    #[test]
    fn global_is_a_singleton() {
        let a = ClientRegistry::global() as *const ClientRegistry;
        let b = ClientRegistry::global() as *const ClientRegistry;
        assert_eq!(a, b);
    }
}

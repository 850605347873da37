//! StateStore — etcd-backed blob persistence with an in-memory test backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};

/// Thread-safe handle to the shared key-value database.
///
/// Cloning is cheap; all clones talk to the same backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Backend,
    tree_prefix: String,
}

#[derive(Clone)]
enum Backend {
    Etcd(etcd_client::Client),
    Memory(Arc<Mutex<MemoryBackend>>),
}

struct MemoryBackend {
    entries: HashMap<String, Vec<u8>>,
    /// Number of writes to accept before failing with a transport error.
    writes_before_failure: Option<usize>,
}

impl StateStore {
    /// Connect to the etcd cluster at `endpoint` (`host:port`).
    pub async fn connect(endpoint: &str, tree_prefix: &str) -> StateResult<Self> {
        let client = etcd_client::Client::connect([endpoint], None)
            .await
            .map_err(|e| StateError::Transport(e.to_string()))?;
        debug!(%endpoint, "state store connected");
        Ok(Self {
            backend: Backend::Etcd(client),
            tree_prefix: tree_prefix.to_string(),
        })
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn in_memory(tree_prefix: &str) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryBackend {
                entries: HashMap::new(),
                writes_before_failure: None,
            }))),
            tree_prefix: tree_prefix.to_string(),
        }
    }

    /// An in-memory store whose write after `writes` successful ones fails
    /// with a transport error; later writes succeed again (for testing
    /// failure paths).
    pub fn in_memory_failing(tree_prefix: &str, writes: usize) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryBackend {
                entries: HashMap::new(),
                writes_before_failure: Some(writes),
            }))),
            tree_prefix: tree_prefix.to_string(),
        }
    }

    /// Open a handle bound to the record `kind/<id>` under the tree prefix.
    pub fn open(&self, kind: &str, id: Uuid) -> StateResult<StoreHandle> {
        if id.is_nil() {
            return Err(StateError::Precondition);
        }
        Ok(StoreHandle {
            backend: self.backend.clone(),
            key: format!("{}/{}/{}", self.tree_prefix, kind, id),
        })
    }
}

/// A handle to exactly one key in the store.
pub struct StoreHandle {
    backend: Backend,
    key: String,
}

impl StoreHandle {
    /// The full key this handle is bound to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the whole value. `NotFound` if the key holds nothing.
    pub async fn read_all(&self) -> StateResult<Vec<u8>> {
        match &self.backend {
            Backend::Etcd(client) => {
                let mut client = client.clone();
                let response = client
                    .get(self.key.as_str(), None)
                    .await
                    .map_err(|e| StateError::Transport(e.to_string()))?;
                match response.kvs().first() {
                    Some(kv) => Ok(kv.value().to_vec()),
                    None => Err(StateError::NotFound(self.key.clone())),
                }
            }
            Backend::Memory(memory) => {
                let memory = memory.lock().unwrap_or_else(|e| e.into_inner());
                memory
                    .entries
                    .get(&self.key)
                    .cloned()
                    .ok_or_else(|| StateError::NotFound(self.key.clone()))
            }
        }
    }

    /// Write the whole value, replacing anything already there.
    pub async fn write(&self, value: &[u8]) -> StateResult<()> {
        match &self.backend {
            Backend::Etcd(client) => {
                let mut client = client.clone();
                client
                    .put(self.key.as_str(), value, None)
                    .await
                    .map_err(|e| StateError::Transport(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(memory) => {
                let mut memory = memory.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(remaining) = memory.writes_before_failure.as_mut() {
                    if *remaining == 0 {
                        memory.writes_before_failure = None;
                        return Err(StateError::Transport("injected write failure".to_string()));
                    }
                    *remaining -= 1;
                }
                memory.entries.insert(self.key.clone(), value.to_vec());
                Ok(())
            }
        }
    }

    /// Delete the key. Deleting an absent key is not an error.
    pub async fn delete(&self) -> StateResult<()> {
        match &self.backend {
            Backend::Etcd(client) => {
                let mut client = client.clone();
                client
                    .delete(self.key.as_str(), None)
                    .await
                    .map_err(|e| StateError::Transport(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(memory) => {
                let mut memory = memory.lock().unwrap_or_else(|e| e.into_inner());
                memory.entries.remove(&self.key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_and_read_round_trip() {
        let store = StateStore::in_memory("execution-space");
        let id = Uuid::new_v4();
        let handle = store.open("checkout", id).unwrap();

        handle.write(b"{\"status\":\"PENDING\"}").await.unwrap();
        let value = handle.read_all().await.unwrap();
        assert_eq!(value, b"{\"status\":\"PENDING\"}");
    }

    #[tokio::test]
    async fn read_missing_key_is_not_found() {
        let store = StateStore::in_memory("execution-space");
        let handle = store.open("checkout", Uuid::new_v4()).unwrap();

        let err = handle.read_all().await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_value_is_distinct_from_missing() {
        let store = StateStore::in_memory("execution-space");
        let handle = store.open("executor", Uuid::new_v4()).unwrap();

        handle.write(b"").await.unwrap();
        assert_eq!(handle.read_all().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = StateStore::in_memory("execution-space");
        let handle = store.open("executor", Uuid::new_v4()).unwrap();

        handle.write(b"spec").await.unwrap();
        handle.delete().await.unwrap();
        handle.delete().await.unwrap();
        assert!(matches!(
            handle.read_all().await.unwrap_err(),
            StateError::NotFound(_)
        ));
    }

    #[test]
    fn nil_id_is_rejected() {
        let store = StateStore::in_memory("execution-space");
        assert!(matches!(
            store.open("checkout", Uuid::nil()),
            Err(StateError::Precondition)
        ));
    }

    #[test]
    fn handles_use_disjoint_prefixes() {
        let store = StateStore::in_memory("execution-space");
        let id = Uuid::new_v4();
        let checkout = store.open("checkout", id).unwrap();
        let executor = store.open("executor", id).unwrap();

        assert_eq!(checkout.key(), format!("execution-space/checkout/{id}"));
        assert_eq!(executor.key(), format!("execution-space/executor/{id}"));
    }

    #[tokio::test]
    async fn failing_store_fails_single_write_after_budget() {
        let store = StateStore::in_memory_failing("execution-space", 2);
        let handle = store.open("executor", Uuid::new_v4()).unwrap();

        handle.write(b"one").await.unwrap();
        handle.write(b"two").await.unwrap();
        let err = handle.write(b"three").await.unwrap_err();
        assert!(matches!(err, StateError::Transport(_)));
        // The store recovers after the injected failure.
        handle.write(b"four").await.unwrap();
    }
}

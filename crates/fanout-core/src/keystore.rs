use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const SENDER_KEY_MEMORY: &str = "sender-key-memory";

/// category -> id -> value; `None` deletes.
pub type KeyWrites = HashMap<String, HashMap<String, Option<Vec<u8>>>>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, category: &str, ids: &[String])
        -> Result<HashMap<String, Vec<u8>>, CoreError>;
    async fn set(&self, writes: KeyWrites) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    entries: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        let guard = self.entries.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                guard
                    .get(&(category.to_string(), id.clone()))
                    .map(|v| (id.clone(), v.clone()))
            })
            .collect())
    }

    async fn set(&self, writes: KeyWrites) -> Result<(), CoreError> {
        let mut guard = self.entries.lock().await;
        for (category, values) in writes {
            for (id, value) in values {
                let key = (category.clone(), id);
                match value {
                    Some(bytes) => {
                        guard.insert(key, bytes);
                    }
                    None => {
                        guard.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Exclusive locks keyed by name, created on first use.
#[derive(Clone, Default)]
pub struct NamedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Takes every named lock in sorted order so overlapping callers cannot
    /// deadlock.
    pub async fn acquire_all(&self, names: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            guards.push(self.acquire(name).await);
        }
        guards
    }
}

/// Hands out exclusive, named transactions over a key store.
#[derive(Clone)]
pub struct KeyTransactions {
    store: Arc<dyn KeyStore>,
    locks: NamedLocks,
}

impl KeyTransactions {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            locks: NamedLocks::new(),
        }
    }

    /// Waits for exclusive access to `name`. Access is released when the
    /// returned transaction is dropped, committed or not.
    pub async fn begin(&self, name: &str) -> Transaction {
        Transaction {
            _guard: self.locks.acquire(name).await,
            store: self.store.clone(),
            pending: KeyWrites::new(),
        }
    }
}

/// Writes are buffered and reach the store only on `commit`; a dropped
/// transaction leaves the store untouched.
pub struct Transaction {
    _guard: OwnedMutexGuard<()>,
    store: Arc<dyn KeyStore>,
    pending: KeyWrites,
}

impl Transaction {
    pub async fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        let mut found = self.store.get(category, ids).await?;
        if let Some(pending) = self.pending.get(category) {
            for id in ids.iter() {
                match pending.get(id) {
                    Some(Some(bytes)) => {
                        found.insert(id.clone(), bytes.clone());
                    }
                    Some(None) => {
                        found.remove(id);
                    }
                    None => {}
                }
            }
        }
        Ok(found)
    }

    pub fn set(&mut self, category: &str, id: &str, value: Option<Vec<u8>>) {
        self.pending
            .entry(category.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }

    pub async fn commit(self) -> Result<(), CoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.set(self.pending).await
    }
}

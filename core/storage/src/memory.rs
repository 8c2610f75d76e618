//! In-memory store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::{validate_key, ItemStore, KeyValueStore};
use mailsync_common::{AccountId, Collection, Error, Model, Result};

type ItemTable = HashMap<(String, Collection), BTreeMap<String, Model>>;

/// In-memory key/value and item store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Value>>>,
    items: Arc<RwLock<ItemTable>>,
    persist_calls: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `persist` calls that reached the store.
    pub fn persist_count(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stored models for a collection, ordered by id.
    pub fn items(&self, account: &AccountId, collection: Collection) -> Vec<Model> {
        self.items
            .read()
            .map(|table| {
                table
                    .get(&(account.to_string(), collection))
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("Writes disabled".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("Memory store lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        let values = self.values.read().map_err(poisoned)?;
        Ok(values.get(key).cloned())
    }

    async fn persist(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;
        self.values
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.values.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let values = self.values.read().map_err(poisoned)?;
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn persist_items(
        &self,
        account: &AccountId,
        collection: Collection,
        items: &[Model],
    ) -> Result<()> {
        self.check_writable()?;
        let mut table = self.items.write().map_err(poisoned)?;
        let stored = table.entry((account.to_string(), collection)).or_default();
        for item in items {
            stored.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn item_count(&self, account: &AccountId, collection: Collection) -> Result<usize> {
        let table = self.items.read().map_err(poisoned)?;
        Ok(table
            .get(&(account.to_string(), collection))
            .map_or(0, BTreeMap::len))
    }
}

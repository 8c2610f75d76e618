//! Store trait definitions.

use async_trait::async_trait;
use serde_json::Value;

use mailsync_common::{AccountId, Collection, Error, Model, Result};

/// Prefix of the key holding a worker's persisted progress.
const STATE_KEY_PREFIX: &str = "sync-worker";

/// Key under which an account's sync progress is persisted.
pub fn state_key(account: &AccountId) -> String {
    format!("{}:{}", STATE_KEY_PREFIX, account)
}

/// Check that a key is usable by every backend.
///
/// # Errors
/// - Key is empty
/// - Key contains control characters or path separators
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
    }
    if key.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err(Error::InvalidInput(format!("Invalid store key: {:?}", key)));
    }
    Ok(())
}

/// Durable key/value store holding JSON documents.
///
/// Each `persist` call is one implicit write transaction: readers observe
/// either the previous value or the new one, never a partial write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Load the value stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing has been persisted under the key.
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    /// - Invalid key
    /// - I/O errors
    async fn persist(&self, key: &str, value: Value) -> Result<()>;

    /// Remove the value stored under `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Local store for the objects pulled from remote collections.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or replace models by id.
    async fn persist_items(
        &self,
        account: &AccountId,
        collection: Collection,
        items: &[Model],
    ) -> Result<()>;

    /// Number of distinct models stored for a collection.
    async fn item_count(&self, account: &AccountId, collection: Collection) -> Result<usize>;
}

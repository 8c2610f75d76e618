//! Local filesystem store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::store::{validate_key, ItemStore, KeyValueStore};
use mailsync_common::{AccountId, Collection, Error, Model, Result};

const STATE_DIR: &str = "state";
const ITEMS_DIR: &str = "items";
const JSON_EXT: &str = "json";

/// Local filesystem store.
///
/// Stores one JSON document per key under `<root>/state` and one JSON
/// document per model under `<root>/items/<account>/<collection>`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root and state directories are created if they don't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(STATE_DIR))?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn encode(name: &str) -> String {
        utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join(format!("{}.{}", Self::encode(key), JSON_EXT))
    }

    fn collection_dir(&self, account: &AccountId, collection: Collection) -> PathBuf {
        self.root
            .join(ITEMS_DIR)
            .join(Self::encode(account.as_str()))
            .join(collection.as_str())
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_atomic(path: &Path, value: &Value) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        let path = self.key_path(key);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn persist(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        let path = self.key_path(key);
        Self::write_atomic(&path, &value).await?;
        debug!("Persisted {} to {}", key, path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(self.root.join(STATE_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JSON_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = percent_decode_str(stem)
                .decode_utf8()
                .map_err(|e| Error::Storage(format!("Undecodable key {}: {}", stem, e)))?;
            keys.push(key.into_owned());
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ItemStore for LocalStore {
    async fn persist_items(
        &self,
        account: &AccountId,
        collection: Collection,
        items: &[Model],
    ) -> Result<()> {
        let dir = self.collection_dir(account, collection);
        fs::create_dir_all(&dir).await?;

        for item in items {
            let path = dir.join(format!("{}.{}", Self::encode(&item.id), JSON_EXT));
            Self::write_atomic(&path, &serde_json::to_value(item)?).await?;
        }

        Ok(())
    }

    async fn item_count(&self, account: &AccountId, collection: Collection) -> Result<usize> {
        let dir = self.collection_dir(account, collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some(JSON_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }
}

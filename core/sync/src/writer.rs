//! Debounced write-behind persistence of sync state.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mailsync_common::{Error, Result};
use mailsync_storage::KeyValueStore;

#[derive(Default)]
struct Slot {
    /// Latest value not yet handed to the store.
    pending: Option<Value>,
    /// Whether a flush task owns the key.
    flushing: bool,
}

/// Coalescing writer for a single store key.
///
/// Every `schedule` replaces the pending value and, if no flush task is
/// running, starts one that waits out the debounce window and writes the
/// latest value. Values scheduled while a write is in flight are written by
/// the same task after another window, so writes for the key never overlap.
#[derive(Clone)]
pub struct StateWriter {
    store: Arc<dyn KeyValueStore>,
    key: String,
    debounce: Duration,
    slot: Arc<Mutex<Slot>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
}

impl StateWriter {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, debounce: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            debounce,
            slot: Arc::new(Mutex::new(Slot::default())),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Key this writer persists to.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `value` for a debounced write.
    ///
    /// Must be called from within a tokio runtime. Ignored after `shutdown`.
    pub fn schedule(&self, value: Value) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut slot = self.slot();
        slot.pending = Some(value);
        if slot.flushing {
            return;
        }
        slot.flushing = true;
        drop(slot);

        let writer = self.clone();
        tokio::spawn(async move { writer.flush_loop().await });
    }

    async fn flush_loop(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Dropping pending write for {}", self.key);
                    return;
                }
                _ = sleep(self.debounce) => {}
            }

            let value = {
                let mut slot = self.slot();
                match slot.pending.take() {
                    Some(value) => value,
                    None => {
                        slot.flushing = false;
                        return;
                    }
                }
            };

            if let Err(e) = self.write(value).await {
                warn!("Failed to persist {}: {}", self.key, e);
            }
        }
    }

    async fn write(&self, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::Terminated);
        }
        self.store.persist(&self.key, value).await?;
        debug!("Persisted {}", self.key);
        Ok(())
    }

    /// Write the pending value now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<()> {
        let value = self.slot().pending.take();
        match value {
            Some(value) => self.write(value).await,
            None => Ok(()),
        }
    }

    /// Write `value` now, superseding anything pending.
    pub async fn write_now(&self, value: Value) -> Result<()> {
        self.slot().pending = None;
        self.write(value).await
    }

    /// Whether a value is waiting to be written.
    pub fn has_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    /// Stop writing. Pending values are dropped and no new write starts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.slot().pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsync_storage::MemoryStore;
    use serde_json::json;

    fn writer(store: &MemoryStore) -> StateWriter {
        StateWriter::new(Arc::new(store.clone()), "state", Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_write() {
        let store = MemoryStore::new();
        let writer = writer(&store);

        for n in 0..10 {
            writer.schedule(json!({ "n": n }));
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(500)).await;

        assert_eq!(store.persist_count(), 1);
        assert_eq!(store.load("state").await.unwrap(), Some(json!({ "n": 9 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_write_separately() {
        let store = MemoryStore::new();
        let writer = writer(&store);

        writer.schedule(json!(1));
        sleep(Duration::from_millis(300)).await;
        writer.schedule(json!(2));
        sleep(Duration::from_millis(300)).await;

        assert_eq!(store.persist_count(), 2);
        assert_eq!(store.load("state").await.unwrap(), Some(json!(2)));
        assert!(!writer.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_write() {
        let store = MemoryStore::new();
        let writer = writer(&store);

        writer.schedule(json!("lost"));
        sleep(Duration::from_millis(50)).await;
        writer.shutdown();
        writer.schedule(json!("ignored"));
        sleep(Duration::from_millis(500)).await;

        assert_eq!(store.persist_count(), 0);
        assert!(store.load("state").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let store = MemoryStore::new();
        let writer = writer(&store);

        writer.schedule(json!("now"));
        writer.flush().await.unwrap();
        assert_eq!(store.load("state").await.unwrap(), Some(json!("now")));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(store.persist_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_logged_not_fatal() {
        let store = MemoryStore::new();
        let writer = writer(&store);

        store.set_fail_writes(true);
        writer.schedule(json!(1));
        sleep(Duration::from_millis(300)).await;

        store.set_fail_writes(false);
        writer.schedule(json!(2));
        sleep(Duration::from_millis(300)).await;

        assert_eq!(store.load("state").await.unwrap(), Some(json!(2)));
    }
}

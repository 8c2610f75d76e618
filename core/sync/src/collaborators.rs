//! Services whose lifecycle follows the sync worker.

use async_trait::async_trait;

use crate::worker::CursorHandle;

/// Long-lived push-update connection streaming incremental changes.
///
/// Started and stopped in lockstep with the worker. The connection reads
/// and advances its stream position through the [`CursorHandle`], and should
/// not consume the stream until the handle reports ready.
#[async_trait]
pub trait DeltaConnection: Send + Sync {
    async fn start(&self, cursor: CursorHandle);

    async fn end(&self);
}

/// Auxiliary cache refreshed while the worker runs.
#[async_trait]
pub trait RefreshCache: Send + Sync {
    /// Get the cache name for logging.
    fn name(&self) -> &str;

    async fn start(&self);

    async fn end(&self);
}

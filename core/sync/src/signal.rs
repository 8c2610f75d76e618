//! Retry signal delivered from outside the worker.

use tokio::sync::mpsc;

use mailsync_common::{Error, Result};

/// Capacity of the retry channel. One queued signal is as good as many.
pub(crate) const RETRY_CHANNEL_CAPACITY: usize = 1;

/// Cloneable sender for retry requests.
///
/// A retry resets the shared backoff and resumes every eligible collection
/// immediately instead of waiting for the timer.
#[derive(Debug, Clone)]
pub struct RetryHandle {
    tx: mpsc::Sender<()>,
}

impl RetryHandle {
    pub(crate) fn new(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Ask the worker to retry now.
    ///
    /// # Errors
    /// - `Terminated` if the worker has been cleaned up
    pub fn request_retry(&self) -> Result<()> {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(Error::Terminated),
        }
    }
}

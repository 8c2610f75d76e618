//! Metadata prefetch that runs before each fetch pass.

use tokio::time::sleep;
use tracing::{debug, info, warn};

use mailsync_common::{MetadataIndex, PageRange};

use crate::worker::WorkerInner;

impl WorkerInner {
    /// Page through all metadata records and index them by object id.
    ///
    /// A failed page is retried at the same offset after the shared backoff
    /// delay, or sooner if a retry is requested; records already received are
    /// kept. Backends without metadata yield an empty index at once.
    ///
    /// # Returns
    /// `None` if the worker was cleaned up before the prefetch finished.
    pub(crate) async fn prefetch_metadata(&self) -> Option<MetadataIndex> {
        let mut index = MetadataIndex::new();

        if !self.api.metadata_supported().await {
            debug!("Backend has no metadata; skipping prefetch");
            return Some(index);
        }

        let limit = self.config.metadata_page_size;
        let mut offset = 0;

        loop {
            if self.terminated.is_cancelled() {
                return None;
            }

            let range = PageRange::new(offset, limit);
            let result = self.api.get_metadata_page(&self.account.id, range).await;
            if self.terminated.is_cancelled() {
                return None;
            }

            match result {
                Ok(records) => {
                    let received = records.len() as u64;
                    index.extend(records);
                    if received != limit {
                        info!(
                            "Prefetched {} metadata records for {} objects",
                            index.record_count(),
                            index.object_count()
                        );
                        return Some(index);
                    }
                    offset += limit;
                }
                Err(e) => {
                    let delay = {
                        let mut timer = self.backoff();
                        timer.backoff();
                        timer.delay()
                    };
                    warn!(
                        "Metadata page {} failed: {}; retrying in {:?}",
                        range, e, delay
                    );

                    tokio::select! {
                        _ = self.terminated.cancelled() => return None,
                        _ = self.prefetch_wake.notified() => debug!("Metadata prefetch woken early"),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

//! Paged fetching of a single collection.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use mailsync_common::{Collection, Error, MetadataIndex, Model, PageRange, Result};

use crate::worker::WorkerInner;

/// Name of the record every label/folder listing must contain.
pub(crate) const INBOX: &str = "inbox";

/// Reject a page of mailbox containers that lacks the inbox.
pub(crate) fn validate_page(collection: Collection, items: &[Model]) -> Result<()> {
    if collection.is_mailbox_container() && !items.iter().any(|m| m.name.as_deref() == Some(INBOX))
    {
        return Err(Error::Validation(format!(
            "Inbox missing from {} response",
            collection
        )));
    }
    Ok(())
}

/// Remaining wait so consecutive page requests start `throttle` apart.
pub(crate) fn throttle_delay(elapsed: Duration, throttle: Duration) -> Duration {
    throttle.saturating_sub(elapsed)
}

impl WorkerInner {
    /// Page through `collection` until a short page or a failure.
    ///
    /// Does nothing when the collection is already busy or complete, so
    /// overlapping resumes never run two loops for one collection.
    pub(crate) async fn fetch_collection(
        self: Arc<Self>,
        collection: Collection,
        initial_limit: u64,
        metadata: Arc<MetadataIndex>,
    ) {
        let begun = self
            .mutate(|state| {
                let entry = state.entry(collection);
                if !entry.is_eligible() {
                    return None;
                }
                let needs_count = entry.count().is_none();
                Some((entry.begin_fetch(initial_limit), needs_count))
            })
            .await
            .flatten();

        let Some((mut range, needs_count)) = begun else {
            debug!("Skipping {}: busy, complete or stopped", collection);
            return;
        };

        if needs_count {
            self.spawn_count_request(collection);
        }

        loop {
            let started = Instant::now();
            let outcome = self.fetch_page(collection, range, &metadata).await;

            if self.terminated.is_cancelled() {
                debug!("Dropping {} page {} after cleanup", collection, range);
                return;
            }

            let received = match outcome {
                Ok(received) => received,
                Err(e) => {
                    if e.is_transient() {
                        warn!("Fetching {} page {} failed: {}", collection, range, e);
                    } else {
                        error!("Fetching {} page {} failed: {}", collection, range, e);
                    }
                    self.fail_collection(collection, range, e).await;
                    return;
                }
            };

            let more = self
                .mutate(|state| state.entry(collection).record_page(range, received))
                .await;
            match more {
                Some(true) => {}
                Some(false) => {
                    info!(
                        "Finished fetching {} ({} items)",
                        collection,
                        range.offset + received
                    );
                    return;
                }
                None => return,
            }

            range = PageRange::new(
                range.offset + received,
                self.config.pages.next_page_size(range.limit),
            );

            let wait = throttle_delay(started.elapsed(), self.config.pages.throttle());
            if !wait.is_zero() {
                tokio::select! {
                    _ = self.terminated.cancelled() => return,
                    _ = sleep(wait) => {}
                }
            }
        }
    }

    /// Fetch, validate and store one page.
    ///
    /// # Returns
    /// The number of items received.
    async fn fetch_page(
        &self,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<u64> {
        debug!("Requesting {} page {}", collection, range);
        let items = self
            .api
            .get_page(&self.account.id, collection, range, metadata)
            .await?;
        validate_page(collection, &items)?;

        if self.terminated.is_cancelled() {
            return Err(Error::Terminated);
        }
        self.items
            .persist_items(&self.account.id, collection, &items)
            .await?;
        Ok(items.len() as u64)
    }

    async fn fail_collection(&self, collection: Collection, range: PageRange, error: Error) {
        let message = error.to_string();
        let recorded = self
            .mutate(move |state| state.entry(collection).record_failure(message, range))
            .await;
        if recorded.is_none() {
            return;
        }

        let mut timer = self.backoff();
        timer.backoff();
        timer.start();
    }

    /// Ask for the remote total without holding up the page loop.
    fn spawn_count_request(self: &Arc<Self>, collection: Collection) {
        let worker = self.clone();
        tokio::spawn(async move {
            let result = worker.api.get_count(&worker.account.id, collection).await;
            if worker.terminated.is_cancelled() {
                return;
            }
            match result {
                Ok(count) => {
                    worker
                        .mutate(|state| state.entry(collection).set_count(count))
                        .await;
                }
                Err(e) => warn!("Count request for {} failed: {}", collection, e),
            }
        });
    }
}

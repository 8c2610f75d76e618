//! Sync worker that orchestrates collection fetches for one account.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mailsync_api::CollectionApi;
use mailsync_common::{Account, Collection, Error, Result};
use mailsync_storage::{state_key, ItemStore, KeyValueStore};

use crate::backoff::{BackoffTimer, TimerCallback};
use crate::collaborators::{DeltaConnection, RefreshCache};
use crate::config::SyncConfig;
use crate::signal::{RetryHandle, RETRY_CHANNEL_CAPACITY};
use crate::state::{CollectionState, SyncState, SyncStats};
use crate::writer::StateWriter;

/// External services the worker drives.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn CollectionApi>,
    pub store: Arc<dyn KeyValueStore>,
    pub items: Arc<dyn ItemStore>,
    pub delta: Option<Arc<dyn DeltaConnection>>,
    pub caches: Vec<Arc<dyn RefreshCache>>,
}

impl Collaborators {
    pub fn new(
        api: Arc<dyn CollectionApi>,
        store: Arc<dyn KeyValueStore>,
        items: Arc<dyn ItemStore>,
    ) -> Self {
        Self {
            api,
            store,
            items,
            delta: None,
            caches: Vec::new(),
        }
    }

    pub fn with_delta(mut self, delta: Arc<dyn DeltaConnection>) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn RefreshCache>) -> Self {
        self.caches.push(cache);
        self
    }
}

pub(crate) struct WorkerInner {
    pub(crate) account: Account,
    pub(crate) config: SyncConfig,
    pub(crate) api: Arc<dyn CollectionApi>,
    pub(crate) items: Arc<dyn ItemStore>,
    delta: Option<Arc<dyn DeltaConnection>>,
    caches: Vec<Arc<dyn RefreshCache>>,
    /// `None` until the persisted state has been loaded.
    state: RwLock<Option<SyncState>>,
    writer: StateWriter,
    backoff: Mutex<BackoffTimer>,
    pub(crate) terminated: CancellationToken,
    started: AtomicBool,
    prefetching: AtomicBool,
    /// Wakes a metadata prefetch waiting out a backoff.
    pub(crate) prefetch_wake: Notify,
    ready: watch::Sender<bool>,
    retry_tx: mpsc::Sender<()>,
    retry_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl WorkerInner {
    pub(crate) fn backoff(&self) -> MutexGuard<'_, BackoffTimer> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Apply `f` to the loaded state and schedule a write of the result.
    ///
    /// Returns `None` without touching anything once terminated or before
    /// the state has been loaded.
    pub(crate) async fn mutate<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> Option<R> {
        if self.terminated.is_cancelled() {
            return None;
        }

        let mut guard = self.state.write().await;
        if self.terminated.is_cancelled() {
            return None;
        }
        let state = guard.as_mut()?;
        let result = f(state);

        match state.to_value() {
            Ok(value) => self.writer.schedule(value),
            Err(e) => warn!("Failed to encode sync state for {}: {}", self.account.id, e),
        }
        Some(result)
    }

    async fn load_state(self: Arc<Self>, store: Arc<dyn KeyValueStore>) {
        let key = self.writer.key().to_string();
        let mut state = match store.load(&key).await {
            Ok(Some(value)) => SyncState::from_value(value).unwrap_or_else(|e| {
                warn!("Discarding unreadable sync state {}: {}", key, e);
                SyncState::new()
            }),
            Ok(None) => SyncState::new(),
            Err(e) => {
                warn!("Failed to load sync state {}: {}", key, e);
                SyncState::new()
            }
        };

        if self.terminated.is_cancelled() {
            return;
        }

        state.clear_busy();
        info!(
            "Loaded sync state for {} ({} collections)",
            self.account.id,
            state.collections().count()
        );
        *self.state.write().await = Some(state);
        self.ready.send_replace(true);

        if self.started.load(Ordering::SeqCst) {
            self.resume_fetches().await;
        }
    }

    /// Collections to sync, with the size of their first page.
    pub(crate) fn catalog(&self) -> Vec<(Collection, u64)> {
        let pages = &self.config.pages;
        vec![
            (Collection::Threads, pages.initial_page_size),
            (
                self.account.primary_collection(),
                pages.organization_page_size,
            ),
            (Collection::Drafts, pages.initial_page_size),
            (Collection::Contacts, pages.initial_page_size),
            (Collection::Calendars, pages.initial_page_size),
            (Collection::Events, pages.initial_page_size),
        ]
    }

    /// Catalog entries that are neither busy nor complete.
    ///
    /// # Returns
    /// `None` while the persisted state is still loading.
    async fn eligible_collections(&self) -> Option<Vec<(Collection, u64)>> {
        let guard = self.state.read().await;
        let state = guard.as_ref()?;
        Some(
            self.catalog()
                .into_iter()
                .filter(|(c, _)| state.get(*c).map_or(true, CollectionState::is_eligible))
                .collect(),
        )
    }

    /// Start a pass over every collection that is neither busy nor complete.
    ///
    /// A resume that arrives while the metadata prefetch is running wakes
    /// it instead; the running pass then fetches whatever is eligible once
    /// its prefetch is done.
    pub(crate) async fn resume_fetches(self: &Arc<Self>) {
        if self.terminated.is_cancelled() {
            return;
        }

        let Some(eligible) = self.eligible_collections().await else {
            debug!("Sync state not loaded yet; deferring resume");
            return;
        };
        self.backoff().cancel();

        if eligible.is_empty() {
            debug!("Nothing left to fetch for {}", self.account.id);
            return;
        }

        if self.prefetching.swap(true, Ordering::SeqCst) {
            debug!("Metadata prefetch already running; waking it");
            self.prefetch_wake.notify_waiters();
            return;
        }
        let metadata = self.prefetch_metadata().await;
        self.prefetching.store(false, Ordering::SeqCst);

        let Some(metadata) = metadata else {
            return;
        };
        let metadata = Arc::new(metadata);

        // Collections may have failed while the prefetch was running.
        let Some(eligible) = self.eligible_collections().await else {
            return;
        };
        info!(
            "Resuming {} collections for {}",
            eligible.len(),
            self.account.id
        );
        for (collection, initial_limit) in eligible {
            tokio::spawn(
                self.clone()
                    .fetch_collection(collection, initial_limit, metadata.clone()),
            );
        }
    }

    async fn retry(self: &Arc<Self>) {
        if self.terminated.is_cancelled() {
            return;
        }
        info!("Retry requested for {}", self.account.id);
        self.backoff().reset();
        self.resume_fetches().await;
    }

    fn spawn_retry_listener(self: &Arc<Self>) {
        let Some(mut rx) = self
            .retry_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let worker = Arc::downgrade(self);
        let terminated = self.terminated.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = terminated.cancelled() => break,
                    signal = rx.recv() => {
                        let (Some(()), Some(worker)) = (signal, worker.upgrade()) else {
                            break;
                        };
                        worker.retry().await;
                    }
                }
            }
            debug!("Retry listener stopped");
        });
    }
}

/// Read/write access to the push-update cursor.
///
/// Handed to the [`DeltaConnection`] on start. Holds no strong reference,
/// so it never keeps a cleaned-up worker alive.
#[derive(Clone)]
pub struct CursorHandle {
    worker: Weak<WorkerInner>,
}

impl CursorHandle {
    /// Whether the persisted state has been loaded.
    pub fn is_ready(&self) -> bool {
        self.worker.upgrade().is_some_and(|w| w.is_ready())
    }

    /// Current stream position.
    pub async fn cursor(&self) -> Option<String> {
        let worker = self.worker.upgrade()?;
        let guard = worker.state.read().await;
        guard.as_ref()?.cursor().map(str::to_string)
    }

    /// Advance the stream position and schedule a write.
    ///
    /// # Errors
    /// - `Terminated` after cleanup
    /// - `InvalidInput` before the state has been loaded
    pub async fn set_cursor(&self, cursor: impl Into<String>) -> Result<()> {
        let worker = self.worker.upgrade().ok_or(Error::Terminated)?;
        if worker.terminated.is_cancelled() {
            return Err(Error::Terminated);
        }
        if !worker.is_ready() {
            return Err(Error::InvalidInput("Sync state not loaded".to_string()));
        }

        let cursor = cursor.into();
        worker
            .mutate(move |state| state.set_cursor(cursor))
            .await
            .ok_or(Error::Terminated)
    }
}

/// Incremental sync worker for one account.
///
/// Construction starts loading the persisted state in the background.
/// Nothing is fetched until [`SyncWorker::start`] is called, and after
/// [`SyncWorker::cleanup`] nothing is mutated or written.
pub struct SyncWorker {
    pub(crate) inner: Arc<WorkerInner>,
}

impl SyncWorker {
    /// Create a worker and begin loading its state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(account: Account, collaborators: Collaborators, config: SyncConfig) -> Self {
        let Collaborators {
            api,
            store,
            items,
            delta,
            caches,
        } = collaborators;

        let writer = StateWriter::new(
            store.clone(),
            state_key(&account.id),
            config.write_debounce(),
        );
        let (retry_tx, retry_rx) = mpsc::channel(RETRY_CHANNEL_CAPACITY);
        let (ready, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<WorkerInner>| {
            let weak = weak.clone();
            let on_timer: TimerCallback = Arc::new(move || {
                if let Some(worker) = weak.upgrade() {
                    tokio::spawn(async move { worker.resume_fetches().await });
                }
            });

            WorkerInner {
                backoff: Mutex::new(BackoffTimer::new(config.backoff.clone(), on_timer)),
                account,
                config,
                api,
                items,
                delta,
                caches,
                state: RwLock::new(None),
                writer,
                terminated: CancellationToken::new(),
                started: AtomicBool::new(false),
                prefetching: AtomicBool::new(false),
                prefetch_wake: Notify::new(),
                ready,
                retry_tx,
                retry_rx: Mutex::new(Some(retry_rx)),
            }
        });

        tokio::spawn(inner.clone().load_state(store));

        Self { inner }
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start syncing. Calling it again has no effect.
    ///
    /// Arms the resume timer, starts the push-update connection and the
    /// refresh caches, then resumes fetches.
    pub async fn start(&self) {
        let inner = &self.inner;
        if inner.terminated.is_cancelled() {
            warn!("Ignoring start() on a cleaned-up worker");
            return;
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Starting sync worker for {}", inner.account.id);
        inner.backoff().start();

        if let Some(delta) = &inner.delta {
            delta.start(self.cursor_handle()).await;
        }
        for cache in &inner.caches {
            debug!("Starting refresh cache {}", cache.name());
            cache.start().await;
        }

        inner.spawn_retry_listener();
        inner.resume_fetches().await;
    }

    /// Stop the worker for good.
    ///
    /// In-flight requests are not aborted; their results are dropped.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        if inner.terminated.is_cancelled() {
            return;
        }

        info!("Cleaning up sync worker for {}", inner.account.id);
        inner.terminated.cancel();
        inner.backoff().cancel();
        inner.writer.shutdown();

        if !inner.started.load(Ordering::SeqCst) {
            return;
        }
        if let Some(delta) = &inner.delta {
            delta.end().await;
        }
        join_all(inner.caches.iter().map(|cache| cache.end())).await;
    }

    /// Start a pass over eligible collections now.
    pub async fn resume_fetches(&self) {
        self.inner.resume_fetches().await;
    }

    /// Reset the backoff and resume immediately.
    pub async fn retry(&self) {
        self.inner.retry().await;
    }

    /// Sender for retry requests from outside the worker.
    pub fn retry_handle(&self) -> RetryHandle {
        RetryHandle::new(self.inner.retry_tx.clone())
    }

    pub fn cursor_handle(&self) -> CursorHandle {
        CursorHandle {
            worker: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the persisted state has been loaded.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Wait until the persisted state has been loaded.
    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives as long as `self`.
        let _ = ready.wait_for(|loaded| *loaded).await;
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    /// Whether any collection is being fetched.
    pub async fn busy(&self) -> bool {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .is_some_and(SyncState::busy)
    }

    /// Snapshot of the sync state; `None` until loaded.
    pub async fn state(&self) -> Option<SyncState> {
        self.inner.state.read().await.clone()
    }

    /// Snapshot of one collection's progress.
    pub async fn collection_state(&self, collection: Collection) -> Option<CollectionState> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.get(collection).cloned())
    }

    pub async fn stats(&self) -> Option<SyncStats> {
        self.inner.state.read().await.as_ref().map(SyncState::stats)
    }

    /// Current delay of the shared resume timer.
    pub fn backoff_delay(&self) -> Duration {
        self.inner.backoff().delay()
    }

    /// Whether a resume is scheduled on the shared timer.
    pub fn is_resume_scheduled(&self) -> bool {
        self.inner.backoff().is_pending()
    }

    /// Persist the current state now, bypassing the debounce.
    ///
    /// # Errors
    /// - `Terminated` after cleanup
    /// - Store errors
    pub async fn flush(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        let Some(state) = self.state().await else {
            return Ok(());
        };
        self.inner.writer.write_now(state.to_value()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailsync_api::{Fault, MockApi};
    use mailsync_common::{AccountId, MetadataRecord, Model, OrganizationUnit, PageRange};
    use mailsync_storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    use crate::state::CollectionPhase;

    struct Harness {
        api: Arc<MockApi>,
        store: MemoryStore,
        worker: SyncWorker,
    }

    fn account_id() -> AccountId {
        AccountId::new("acc-1").unwrap()
    }

    fn mock_api() -> Arc<MockApi> {
        let api = Arc::new(MockApi::new());
        let mailboxes = vec![
            Model::new("mb-inbox").with_name("inbox"),
            Model::new("mb-sent").with_name("sent"),
        ];
        api.set_dataset(Collection::Labels, mailboxes.clone());
        api.set_dataset(Collection::Folders, mailboxes);
        api
    }

    fn build(
        api: Arc<MockApi>,
        store: MemoryStore,
        unit: OrganizationUnit,
        configure: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Harness {
        let account = Account::new(account_id(), unit);
        let collaborators = configure(Collaborators::new(
            api.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let worker = SyncWorker::new(account, collaborators, SyncConfig::default());
        Harness { api, store, worker }
    }

    fn harness(unit: OrganizationUnit) -> Harness {
        build(mock_api(), MemoryStore::new(), unit, |c| c)
    }

    async fn contacts(worker: &SyncWorker) -> CollectionState {
        worker
            .collection_state(Collection::Contacts)
            .await
            .unwrap_or_default()
    }

    #[derive(Default)]
    struct RecordingDelta {
        handle: Mutex<Option<CursorHandle>>,
        started: AtomicU32,
        ended: AtomicU32,
    }

    #[async_trait]
    impl DeltaConnection for RecordingDelta {
        async fn start(&self, cursor: CursorHandle) {
            self.started.fetch_add(1, Ordering::SeqCst);
            *self.handle.lock().unwrap() = Some(cursor);
        }

        async fn end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingCache {
        started: AtomicU32,
        ended: AtomicU32,
    }

    #[async_trait]
    impl RefreshCache for RecordingCache {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_grow_and_complete() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 40);
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_secs(1)).await;
        let state = contacts(&h.worker).await;
        assert_eq!(state.fetched(), 30);
        assert!(state.busy());
        assert!(h.worker.busy().await);

        sleep(Duration::from_secs(2)).await;
        let state = contacts(&h.worker).await;
        assert_eq!(state.fetched(), 40);
        assert!(state.complete());
        assert!(!state.busy());
        assert!(state.error().is_none());
        assert_eq!(state.count(), Some(40));

        assert_eq!(
            h.api.page_requests(Collection::Contacts),
            vec![PageRange::new(0, 30), PageRange::new(30, 45)]
        );
        assert_eq!(h.store.items(&account_id(), Collection::Contacts).len(), 40);
        assert!(!h.worker.busy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_uses_organization_page_size() {
        let h = harness(OrganizationUnit::Label);
        h.worker.wait_ready().await;
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(
            h.api.page_requests(Collection::Labels),
            vec![PageRange::new(0, 1000)]
        );
        assert!(h.api.page_requests(Collection::Folders).is_empty());
        for collection in [
            Collection::Threads,
            Collection::Drafts,
            Collection::Contacts,
            Collection::Calendars,
            Collection::Events,
        ] {
            assert_eq!(h.api.page_requests(collection), vec![PageRange::new(0, 30)]);
        }

        let stats = h.worker.stats().await.unwrap();
        assert_eq!(stats.collections, 6);
        assert_eq!(stats.complete, 6);
        assert_eq!(stats.fetched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_inbox_fails_and_resumes_after_backoff() {
        let h = harness(OrganizationUnit::Folder);
        h.api.push_fault(Collection::Folders, Fault::DropInbox);
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_secs(1)).await;
        let folders = h.worker.collection_state(Collection::Folders).await.unwrap();
        assert!(!folders.busy());
        assert!(!folders.complete());
        assert!(folders.error().unwrap().contains("Inbox missing"));
        assert_eq!(folders.error_request_range(), Some(PageRange::new(0, 1000)));
        assert_eq!(h.worker.backoff_delay(), Duration::from_secs(28));
        assert!(h.worker.is_resume_scheduled());

        sleep(Duration::from_secs(28)).await;
        assert_eq!(
            h.api.page_requests(Collection::Folders),
            vec![PageRange::new(0, 1000), PageRange::new(0, 1000)]
        );
        let folders = h.worker.collection_state(Collection::Folders).await.unwrap();
        assert!(folders.complete());
        assert!(folders.error().is_none());
        // Complete collections are left alone by the timer-driven pass.
        assert_eq!(h.api.page_requests(Collection::Threads).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_grow_backoff_until_retry() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 10);
        h.api
            .push_fault(Collection::Contacts, Fault::Network("reset".into()));
        h.api
            .push_fault(Collection::Contacts, Fault::Network("reset".into()));
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.worker.backoff_delay(), Duration::from_secs(28));
        assert_eq!(contacts(&h.worker).await.error(), Some("Network error: reset"));

        sleep(Duration::from_secs(28)).await;
        assert_eq!(h.worker.backoff_delay(), Duration::from_millis(39_200));
        assert_eq!(h.api.page_requests(Collection::Contacts).len(), 2);

        h.worker.retry().await;
        assert_eq!(h.worker.backoff_delay(), Duration::from_secs(20));
        sleep(Duration::from_secs(1)).await;

        let state = contacts(&h.worker).await;
        assert!(state.complete());
        assert_eq!(state.fetched(), 10);
        assert_eq!(
            h.api.page_requests(Collection::Contacts),
            vec![PageRange::new(0, 30); 3]
        );
        assert!(!h.worker.is_resume_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_handle_resumes_immediately() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Events, "e", 3);
        h.api
            .push_fault(Collection::Events, Fault::Network("down".into()));
        h.worker.wait_ready().await;
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;
        assert!(h
            .worker
            .collection_state(Collection::Events)
            .await
            .unwrap()
            .error()
            .is_some());

        h.worker.retry_handle().request_retry().unwrap();
        sleep(Duration::from_secs(1)).await;

        let events = h.worker.collection_state(Collection::Events).await.unwrap();
        assert!(events.complete());
        assert_eq!(events.fetched(), 3);
        assert_eq!(h.worker.backoff_delay(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resumes_at_failed_window() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 40);
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_millis(100)).await;
        h.api
            .push_fault(Collection::Contacts, Fault::Network("timeout".into()));
        sleep(Duration::from_secs(2)).await;

        let state = contacts(&h.worker).await;
        assert_eq!(state.fetched(), 30);
        assert_eq!(state.error_request_range(), Some(PageRange::new(30, 45)));

        h.worker.retry().await;
        sleep(Duration::from_secs(1)).await;

        let state = contacts(&h.worker).await;
        assert!(state.complete());
        assert_eq!(state.fetched(), 40);
        assert_eq!(
            h.api.page_requests(Collection::Contacts),
            vec![
                PageRange::new(0, 30),
                PageRange::new(30, 45),
                PageRange::new(30, 45)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_resumes_run_one_loop() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 40);
        h.api.set_latency(Duration::from_secs(1));
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_millis(500)).await;
        h.worker.resume_fetches().await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(
            h.api.page_requests(Collection::Contacts),
            vec![PageRange::new(0, 30), PageRange::new(30, 45)]
        );
        assert!(contacts(&h.worker).await.complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_prefetch_is_resumed() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 20_000);
        h.api
            .push_fault(Collection::Events, Fault::Network("down".to_string()));
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_secs(1)).await;
        let events = h.worker.collection_state(Collection::Events).await.unwrap();
        assert!(events.error().is_some());

        // The backoff resume for events stalls in a failing prefetch.
        h.api.push_metadata_fault(0, "flaky");
        h.api.push_metadata_fault(0, "flaky");
        sleep(Duration::from_secs(28)).await;
        assert!(contacts(&h.worker).await.busy());

        h.api
            .push_fault(Collection::Contacts, Fault::Network("reset".to_string()));
        sleep(Duration::from_secs(600)).await;

        let state = contacts(&h.worker).await;
        assert!(state.complete());
        assert_eq!(state.fetched(), 20_000);
        let events = h.worker.collection_state(Collection::Events).await.unwrap();
        assert!(events.complete());
        assert!(h
            .api
            .page_requests(Collection::Contacts)
            .windows(2)
            .any(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_without_waiting_prefetch_is_not_kept() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_latency(Duration::from_secs(1));
        h.api.push_metadata_fault(0, "down");
        h.worker.wait_ready().await;

        let inner = h.worker.inner.clone();
        tokio::spawn(async move { inner.resume_fetches().await });
        sleep(Duration::from_millis(500)).await;
        h.worker.resume_fetches().await;

        sleep(Duration::from_millis(9500)).await;
        assert_eq!(h.api.metadata_requests().len(), 1);

        sleep(Duration::from_secs(25)).await;
        assert_eq!(h.api.metadata_requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_handle_before_state_loads() {
        let h = harness(OrganizationUnit::Label);
        let handle = h.worker.cursor_handle();
        assert!(!handle.is_ready());
        assert!(matches!(
            handle.set_cursor("c-0").await,
            Err(Error::InvalidInput(_))
        ));

        h.worker.wait_ready().await;
        assert!(handle.is_ready());
        handle.set_cursor("c-0").await.unwrap();
        assert_eq!(handle.cursor().await.as_deref(), Some("c-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_changes_after_cleanup() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 40);
        h.api.set_latency(Duration::from_secs(5));
        h.worker.wait_ready().await;
        h.worker.start().await;

        sleep(Duration::from_secs(1)).await;
        let before = h.worker.state().await;
        let writes = h.store.persist_count();
        h.worker.cleanup().await;
        assert!(h.worker.is_terminated());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.worker.state().await, before);
        assert_eq!(h.store.persist_count(), writes);
        assert!(h.store.items(&account_id(), Collection::Contacts).is_empty());
        assert!(!h.worker.is_resume_scheduled());

        h.worker.retry().await;
        h.worker.resume_fetches().await;
        h.worker.start().await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.api.page_requests(Collection::Contacts).len(), 1);
        assert!(matches!(
            h.worker.retry_handle().request_retry(),
            Err(Error::Terminated)
        ));
        assert!(matches!(h.worker.flush().await, Err(Error::Terminated)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_state_resumes_where_it_left_off() {
        let store = MemoryStore::new();
        let mut saved = SyncState::new();
        saved.set_cursor("cursor-7");
        saved
            .entry(Collection::Threads)
            .record_page(PageRange::new(0, 30), 30);
        saved
            .entry(Collection::Labels)
            .record_page(PageRange::new(0, 1000), 2);
        let contacts_state = saved.entry(Collection::Contacts);
        contacts_state.record_page(PageRange::new(0, 30), 30);
        contacts_state.record_failure("Network error: reset", PageRange::new(30, 45));
        store
            .persist(&state_key(&account_id()), saved.to_value().unwrap())
            .await
            .unwrap();

        let api = mock_api();
        api.set_generated(Collection::Contacts, "c", 40);
        let h = build(api, store, OrganizationUnit::Label, |c| c);
        h.worker.wait_ready().await;

        let loaded = h.worker.state().await.unwrap();
        assert!(!loaded.busy());
        assert_eq!(loaded.cursor(), Some("cursor-7"));
        assert_eq!(
            loaded.get(Collection::Threads).unwrap().phase(),
            &CollectionPhase::Idle
        );

        h.worker.start().await;
        sleep(Duration::from_secs(5)).await;

        assert!(h.api.page_requests(Collection::Labels).is_empty());
        assert_eq!(
            h.api.page_requests(Collection::Contacts),
            vec![PageRange::new(30, 45)]
        );
        assert_eq!(
            h.api.page_requests(Collection::Threads),
            vec![PageRange::new(0, 30)]
        );
        let state = contacts(&h.worker).await;
        assert!(state.complete());
        assert_eq!(state.fetched(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_before_load_resumes_once_loaded() {
        let h = harness(OrganizationUnit::Label);
        h.worker.start().await;
        assert!(h.api.metadata_requests().is_empty());

        sleep(Duration::from_secs(1)).await;
        assert!(h.worker.is_ready());
        assert_eq!(h.api.page_requests(Collection::Threads).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_state_starts_fresh() {
        let store = MemoryStore::new();
        store
            .persist(&state_key(&account_id()), json!("garbage"))
            .await
            .unwrap();
        let h = build(mock_api(), store, OrganizationUnit::Label, |c| c);

        h.worker.wait_ready().await;
        assert_eq!(h.worker.state().await, Some(SyncState::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_persisted_under_account_key() {
        let h = harness(OrganizationUnit::Label);
        h.worker.wait_ready().await;
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;

        let value = h
            .store
            .load("sync-worker:acc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["labels"]["complete"], json!(true));
        assert_eq!(value["labels"]["fetched"], json!(2));
        assert_eq!(value["contacts"]["busy"], json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_bypasses_debounce() {
        let h = harness(OrganizationUnit::Label);
        h.worker.wait_ready().await;
        h.worker.flush().await.unwrap();

        assert_eq!(h.store.persist_count(), 1);
        assert_eq!(
            h.store.load("sync-worker:acc-1").await.unwrap(),
            Some(json!({}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_is_attached_to_pages() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Threads, "t", 3);
        h.api.set_metadata(vec![MetadataRecord {
            object_id: "t-1".to_string(),
            object_type: Some("thread".to_string()),
            plugin_id: Some("reminders".to_string()),
            version: 2,
            value: json!({ "due": 1700000000 }),
        }]);
        h.worker.wait_ready().await;
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;

        let threads = h.store.items(&account_id(), Collection::Threads);
        assert_eq!(threads.len(), 3);
        let with_metadata: Vec<&str> = threads
            .iter()
            .filter(|t| !t.metadata.is_empty())
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(with_metadata, vec!["t-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_failure_does_not_stop_paging() {
        let h = harness(OrganizationUnit::Label);
        h.api.set_generated(Collection::Contacts, "c", 5);
        h.api.set_fail_counts(true);
        h.worker.wait_ready().await;
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;

        let state = contacts(&h.worker).await;
        assert!(state.complete());
        assert_eq!(state.count(), None);
        assert!(h.api.count_requests().contains(&Collection::Contacts));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_store_failure_marks_collection_failed() {
        let h = harness(OrganizationUnit::Label);
        h.worker.wait_ready().await;
        h.store.set_fail_writes(true);
        h.worker.start().await;
        sleep(Duration::from_secs(1)).await;

        let state = contacts(&h.worker).await;
        assert!(state.error().unwrap().contains("Storage error"));
        assert_eq!(state.error_request_range(), Some(PageRange::new(0, 30)));
        assert!(h.worker.is_resume_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collaborators_follow_lifecycle() {
        let delta = Arc::new(RecordingDelta::default());
        let cache = Arc::new(RecordingCache::default());
        let h = build(mock_api(), MemoryStore::new(), OrganizationUnit::Label, |c| {
            c.with_delta(delta.clone()).with_cache(cache.clone())
        });
        h.worker.wait_ready().await;

        h.worker.start().await;
        h.worker.start().await;
        assert_eq!(delta.started.load(Ordering::SeqCst), 1);
        assert_eq!(cache.started.load(Ordering::SeqCst), 1);

        let handle = delta.handle.lock().unwrap().clone().unwrap();
        assert!(handle.is_ready());
        assert_eq!(handle.cursor().await, None);
        handle.set_cursor("c-1").await.unwrap();
        assert_eq!(handle.cursor().await.as_deref(), Some("c-1"));

        sleep(Duration::from_secs(1)).await;
        let value = h.store.load("sync-worker:acc-1").await.unwrap().unwrap();
        assert_eq!(value["cursor"], json!("c-1"));

        h.worker.cleanup().await;
        h.worker.cleanup().await;
        assert_eq!(delta.ended.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ended.load(Ordering::SeqCst), 1);
        assert!(matches!(
            handle.set_cursor("c-2").await,
            Err(Error::Terminated)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_before_start_skips_collaborators() {
        let delta = Arc::new(RecordingDelta::default());
        let h = build(mock_api(), MemoryStore::new(), OrganizationUnit::Label, |c| {
            c.with_delta(delta.clone())
        });

        h.worker.cleanup().await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(delta.ended.load(Ordering::SeqCst), 0);
        assert!(!h.worker.is_ready());
        assert_eq!(h.store.persist_count(), 0);
    }
}

//! In-memory collection API for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use mailsync_common::{
    AccountId, Collection, Error, MetadataIndex, MetadataRecord, Model, PageRange, Result,
};

use crate::api::CollectionApi;

/// A scripted deviation applied to the next page request of a collection.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the request with a network error.
    Network(String),
    /// Serve the page with any model named `inbox` removed.
    DropInbox,
}

#[derive(Default)]
struct Inner {
    datasets: HashMap<Collection, Vec<Model>>,
    metadata: Vec<MetadataRecord>,
    faults: HashMap<Collection, VecDeque<Fault>>,
    metadata_faults: HashMap<u64, VecDeque<String>>,
    page_requests: Vec<(Collection, PageRange)>,
    metadata_requests: Vec<PageRange>,
    count_requests: Vec<Collection>,
    latency: Duration,
}

/// In-memory collection API.
///
/// Serves fixed datasets with offset/limit slicing, records every request
/// and replays scripted faults.
pub struct MockApi {
    inner: Mutex<Inner>,
    metadata_supported: AtomicBool,
    fail_counts: AtomicBool,
}

impl MockApi {
    /// Create an API with empty collections and metadata support enabled.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            metadata_supported: AtomicBool::new(true),
            fail_counts: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the contents of a collection.
    pub fn set_dataset(&self, collection: Collection, models: Vec<Model>) {
        self.lock().datasets.insert(collection, models);
    }

    /// Fill a collection with `len` models whose ids are `<prefix>-<n>`.
    pub fn set_generated(&self, collection: Collection, prefix: &str, len: usize) {
        let models = (0..len)
            .map(|n| Model::new(format!("{}-{}", prefix, n)))
            .collect();
        self.set_dataset(collection, models);
    }

    /// Replace the metadata records.
    pub fn set_metadata(&self, records: Vec<MetadataRecord>) {
        self.lock().metadata = records;
    }

    pub fn set_metadata_supported(&self, supported: bool) {
        self.metadata_supported.store(supported, Ordering::SeqCst);
    }

    /// Make count requests fail.
    pub fn set_fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Queue a fault for the next page request of `collection`.
    pub fn push_fault(&self, collection: Collection, fault: Fault) {
        self.lock()
            .faults
            .entry(collection)
            .or_default()
            .push_back(fault);
    }

    /// Queue a network failure for the next metadata request at `offset`.
    pub fn push_metadata_fault(&self, offset: u64, message: impl Into<String>) {
        self.lock()
            .metadata_faults
            .entry(offset)
            .or_default()
            .push_back(message.into());
    }

    /// Page requests issued for `collection`, in order.
    pub fn page_requests(&self, collection: Collection) -> Vec<PageRange> {
        self.lock()
            .page_requests
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Total page requests across all collections.
    pub fn total_page_requests(&self) -> usize {
        self.lock().page_requests.len()
    }

    pub fn metadata_requests(&self) -> Vec<PageRange> {
        self.lock().metadata_requests.clone()
    }

    pub fn count_requests(&self) -> Vec<Collection> {
        self.lock().count_requests.clone()
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    fn slice<T: Clone>(items: &[T], range: PageRange) -> Vec<T> {
        items
            .iter()
            .skip(range.offset as usize)
            .take(range.limit as usize)
            .cloned()
            .collect()
    }

    async fn serve_page(
        &self,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        self.lock().page_requests.push((collection, range));

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (fault, mut page) = {
            let mut inner = self.lock();
            let fault = inner
                .faults
                .get_mut(&collection)
                .and_then(VecDeque::pop_front);
            let dataset = inner.datasets.get(&collection).cloned().unwrap_or_default();
            (fault, Self::slice(&dataset, range))
        };

        match fault {
            Some(Fault::Network(message)) => return Err(Error::Network(message)),
            Some(Fault::DropInbox) => page.retain(|m| m.name.as_deref() != Some("inbox")),
            None => {}
        }

        metadata.attach(&mut page);
        Ok(page)
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionApi for MockApi {
    async fn get_count(&self, _account: &AccountId, collection: Collection) -> Result<u64> {
        self.lock().count_requests.push(collection);
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(Error::Network("count unavailable".to_string()));
        }
        let inner = self.lock();
        Ok(inner.datasets.get(&collection).map_or(0, Vec::len) as u64)
    }

    async fn get_threads(
        &self,
        _account: &AccountId,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        self.serve_page(Collection::Threads, range, metadata).await
    }

    async fn get_collection(
        &self,
        _account: &AccountId,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        self.serve_page(collection, range, metadata).await
    }

    async fn metadata_supported(&self) -> bool {
        self.metadata_supported.load(Ordering::SeqCst)
    }

    async fn get_metadata_page(
        &self,
        _account: &AccountId,
        range: PageRange,
    ) -> Result<Vec<MetadataRecord>> {
        self.lock().metadata_requests.push(range);

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        let fault = inner
            .metadata_faults
            .get_mut(&range.offset)
            .and_then(VecDeque::pop_front);
        if let Some(message) = fault {
            return Err(Error::Network(message));
        }
        Ok(Self::slice(&inner.metadata, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::new("acc").unwrap()
    }

    #[tokio::test]
    async fn test_slices_by_offset_and_limit() {
        let api = MockApi::new();
        api.set_generated(Collection::Contacts, "c", 5);
        let index = MetadataIndex::new();

        let page = api
            .get_page(&account(), Collection::Contacts, PageRange::new(3, 4), &index)
            .await
            .unwrap();

        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c-3", "c-4"]);
        assert_eq!(
            api.page_requests(Collection::Contacts),
            vec![PageRange::new(3, 4)]
        );
    }

    #[tokio::test]
    async fn test_threads_route_to_thread_endpoint() {
        let api = MockApi::new();
        api.set_generated(Collection::Threads, "t", 2);

        let page = api
            .get_page(&account(), Collection::Threads, PageRange::first(10), &MetadataIndex::new())
            .await
            .unwrap();

        assert_eq!(page.len(), 2);
        assert_eq!(api.page_requests(Collection::Threads).len(), 1);
    }

    #[tokio::test]
    async fn test_faults_apply_once() {
        let api = MockApi::new();
        api.set_dataset(
            Collection::Folders,
            vec![Model::new("f1").with_name("inbox"), Model::new("f2")],
        );
        api.push_fault(Collection::Folders, Fault::Network("boom".into()));
        api.push_fault(Collection::Folders, Fault::DropInbox);
        let index = MetadataIndex::new();
        let range = PageRange::first(10);

        let first = api.get_page(&account(), Collection::Folders, range, &index).await;
        assert!(matches!(first, Err(Error::Network(_))));

        let second = api
            .get_page(&account(), Collection::Folders, range, &index)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);

        let third = api
            .get_page(&account(), Collection::Folders, range, &index)
            .await
            .unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn test_count_and_metadata() {
        let api = MockApi::new();
        api.set_generated(Collection::Events, "e", 7);
        assert_eq!(api.get_count(&account(), Collection::Events).await.unwrap(), 7);

        api.set_fail_counts(true);
        assert!(api.get_count(&account(), Collection::Events).await.is_err());

        api.push_metadata_fault(0, "flaky");
        assert!(api
            .get_metadata_page(&account(), PageRange::first(200))
            .await
            .is_err());
        assert!(api
            .get_metadata_page(&account(), PageRange::first(200))
            .await
            .unwrap()
            .is_empty());
    }
}

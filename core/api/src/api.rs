//! Collection API trait definition.

use async_trait::async_trait;

use mailsync_common::{
    AccountId, Collection, MetadataIndex, MetadataRecord, Model, PageRange, Result,
};

/// Page size used by the metadata endpoint.
pub const METADATA_PAGE_SIZE: u64 = 200;

/// Remote API serving paginated collections.
///
/// Every call delivers exactly one of success or error. Implementations
/// handle their own authentication.
#[async_trait]
pub trait CollectionApi: Send + Sync {
    /// Best-effort total number of objects in a collection.
    async fn get_count(&self, account: &AccountId, collection: Collection) -> Result<u64>;

    /// Fetch a page of threads. Threads use their own endpoint but the same
    /// paging contract as every other collection.
    async fn get_threads(
        &self,
        account: &AccountId,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>>;

    /// Fetch a page of any non-thread collection.
    async fn get_collection(
        &self,
        account: &AccountId,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>>;

    /// Whether the backend serves the metadata endpoint at all.
    async fn metadata_supported(&self) -> bool;

    /// Fetch a page of metadata records.
    async fn get_metadata_page(
        &self,
        account: &AccountId,
        range: PageRange,
    ) -> Result<Vec<MetadataRecord>>;

    /// Fetch a page of `collection`, routing threads to their endpoint.
    ///
    /// Returned models carry the metadata attached from `metadata`.
    async fn get_page(
        &self,
        account: &AccountId,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        match collection {
            Collection::Threads => self.get_threads(account, range, metadata).await,
            other => self.get_collection(account, other, range, metadata).await,
        }
    }
}

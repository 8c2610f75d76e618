//! HTTP client for the collection API.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use mailsync_common::{
    AccountId, Collection, Error, MetadataIndex, MetadataRecord, Model, PageRange, Result,
};

use crate::api::CollectionApi;

const USER_AGENT: &str = "Mailsync/0.1";

/// Configuration for [`HttpApi`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API root, e.g. `https://api.example.com/`.
    pub base_url: String,
    /// Bearer token for the account.
    pub token: String,
    /// Whether the backend serves `/metadata`.
    #[serde(default = "default_metadata_supported")]
    pub metadata_supported: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_metadata_supported() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            metadata_supported: default_metadata_supported(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Response of a `view=count` request.
#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Collection API client speaking JSON over HTTP.
pub struct HttpApi {
    http: Client,
    base_url: Url,
    token: String,
    metadata_supported: bool,
}

impl HttpApi {
    /// Create a new client.
    ///
    /// # Errors
    /// - Base URL does not parse
    /// - HTTP client cannot be built
    pub fn new(config: ApiConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        // `Url::join` drops the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: config.token,
            metadata_supported: config.metadata_supported,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!("GET {} {:?}", url, query);

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request to {} failed: {}", path, e)))?;

        self.handle_response(response).await
    }

    async fn get_models(
        &self,
        path: &str,
        mut query: Vec<(&str, String)>,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        query.push(("offset", range.offset.to_string()));
        query.push(("limit", range.limit.to_string()));

        let mut models: Vec<Model> = self.get_json(path, &query).await?;
        metadata.attach(&mut models);
        Ok(models)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, body))
        }
    }
}

/// Map a non-success status to an error.
fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Authentication(format!("Request rejected: {}", status))
        }
        _ => Error::Network(format!("API error: {} - {}", status, body)),
    }
}

#[async_trait]
impl CollectionApi for HttpApi {
    async fn get_count(&self, account: &AccountId, collection: Collection) -> Result<u64> {
        debug!("Requesting {} count for {}", collection, account);
        let response: CountResponse = self
            .get_json(collection.as_str(), &[("view", "count".to_string())])
            .await?;
        Ok(response.count)
    }

    async fn get_threads(
        &self,
        account: &AccountId,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        debug!("Requesting threads for {} ({})", account, range);
        self.get_models(
            Collection::Threads.as_str(),
            vec![("view", "expanded".to_string())],
            range,
            metadata,
        )
        .await
    }

    async fn get_collection(
        &self,
        account: &AccountId,
        collection: Collection,
        range: PageRange,
        metadata: &MetadataIndex,
    ) -> Result<Vec<Model>> {
        debug!("Requesting {} for {} ({})", collection, account, range);
        self.get_models(collection.as_str(), Vec::new(), range, metadata)
            .await
    }

    async fn metadata_supported(&self) -> bool {
        self.metadata_supported
    }

    async fn get_metadata_page(
        &self,
        account: &AccountId,
        range: PageRange,
    ) -> Result<Vec<MetadataRecord>> {
        debug!("Requesting metadata for {} ({})", account, range);
        self.get_json(
            "metadata",
            &[
                ("offset", range.offset.to_string()),
                ("limit", range.limit.to_string()),
            ],
        )
        .await
    }
}

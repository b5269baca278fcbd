//! HTTP plumbing shared by the listing source and the remote store.
//!
//! `HttpClient` wraps a pooled `reqwest::Client` with bearer auth, status
//! mapping and exponential backoff on 429. `HttpListingSource` uses it to
//! call the scraper service's `/events` endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, ListingSource};
use crate::config::SourceConfig;
use crate::models::Record;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP client with optional bearer token.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    token: Option<Arc<str>>,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token: None,
        })
    }

    /// Create a client with the given token, sharing the connection pool.
    pub fn with_token(&self, token: Option<&str>) -> Self {
        Self {
            client: self.client.clone(),
            token: token.map(Arc::from),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, rebuilding it for each attempt, backing off on 429.
    async fn send<F>(&self, url: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.authorize(build(&self.client)).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn parse<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self.send(url, |c| c.get(url).query(query)).await?;
        Self::parse(url, response).await
    }

    /// GET that maps 404 to `None`.
    pub async fn get_optional_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, ApiError> {
        match self.send(url, |c| c.get(url)).await {
            Ok(response) => Self::parse(url, response).await.map(Some),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put_json<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<(), ApiError> {
        self.send(url, |c| c.put(url).json(body)).await?;
        Ok(())
    }

    /// DELETE that treats 404 as success.
    pub async fn delete(&self, url: &str) -> Result<(), ApiError> {
        match self.send(url, |c| c.delete(url)).await {
            Ok(_) | Err(ApiError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Listing source
// ============================================================================

/// `/events` responses come either as a bare array or wrapped in `{"events": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingsResponse {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(default)]
        events: Vec<Value>,
    },
}

impl ListingsResponse {
    fn into_records(self) -> Vec<Record> {
        let values = match self {
            ListingsResponse::Bare(values) => values,
            ListingsResponse::Wrapped { events } => events,
        };
        let total = values.len();
        let records: Vec<Record> = values.into_iter().filter_map(Record::from_value).collect();
        if records.len() < total {
            debug!(skipped = total - records.len(), "Skipped non-object listings");
        }
        records
    }
}

/// Listing source backed by the scraper service's REST API.
#[derive(Clone)]
pub struct HttpListingSource {
    http: HttpClient,
    base_url: String,
    regions: Vec<String>,
    categories: Vec<String>,
    max_pages: u32,
}

impl HttpListingSource {
    pub fn new(config: &SourceConfig, timeout: Duration) -> Result<Self, ApiError> {
        let http = HttpClient::new(timeout)?.with_token(config.api_token.as_deref());
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            regions: config.regions.clone(),
            categories: config.categories.clone(),
            max_pages: config.max_pages,
        })
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch(&self, region: &str, category: &str) -> Result<Vec<Record>, ApiError> {
        let url = format!("{}/events", self.base_url);
        let query = [
            ("region", region.to_string()),
            ("category", category.to_string()),
            ("max_pages", self.max_pages.to_string()),
        ];
        let response: ListingsResponse = self.http.get_json(&url, &query).await?;
        let records = response.into_records();
        debug!(region, category, count = records.len(), "Fetched listings");
        Ok(records)
    }

    fn supported_regions(&self) -> Vec<String> {
        self.regions.clone()
    }

    fn supported_categories(&self) -> Vec<String> {
        self.categories.clone()
    }
}

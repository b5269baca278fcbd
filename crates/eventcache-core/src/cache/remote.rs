//! Shared remote tier.
//!
//! The remote store holds one JSON document per cache key and is visible to
//! every instance. It is a warm-up and sharing mechanism only: reads that
//! fail are misses, writes are best effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiError, HttpClient};
use crate::config::RemoteConfig;
use crate::utils::{read, write};

/// Document store keyed by rendered cache keys.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApiError>;

    async fn put(&self, key: &str, document: Value) -> Result<(), ApiError>;

    /// Deleting a missing document is not an error.
    async fn delete(&self, key: &str) -> Result<(), ApiError>;

    async fn keys(&self) -> Result<Vec<String>, ApiError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Remote store held in process memory.
///
/// Share one instance (behind an `Arc`) between several `TieredStore`s to
/// model instances sharing a backend. Counts calls and can be switched
/// offline to simulate an unreachable backend.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    documents: RwLock<HashMap<String, Value>>,
    offline: AtomicBool,
    gets: AtomicUsize,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Store a document without going through the trait (no call counted).
    pub fn insert_raw(&self, key: &str, document: Value) {
        write(&self.documents).insert(key.to_string(), document);
    }

    pub fn document(&self, key: &str) -> Option<Value> {
        read(&self.documents).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::Unavailable("remote store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApiError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.document(key))
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), ApiError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.insert_raw(key, document);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ApiError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        write(&self.documents).remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, ApiError> {
        self.check_online()?;
        let mut keys: Vec<String> = read(&self.documents).keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// HTTP store
// ============================================================================

/// Key listings come either as a bare array or wrapped in `{"keys": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeysResponse {
    Bare(Vec<String>),
    Wrapped {
        #[serde(default)]
        keys: Vec<String>,
    },
}

/// Remote store backed by a REST document collection:
/// `GET/PUT/DELETE {base_url}/{collection}/{key}` and `GET {base_url}/{collection}`.
///
/// Keys are percent-encoded as a single path segment, so characters such as
/// `?`, `#` or `%` in a region never change which document is addressed.
#[derive(Clone)]
pub struct HttpRemoteStore {
    http: HttpClient,
    collection_url: Url,
}

impl HttpRemoteStore {
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Result<Self, ApiError> {
        let http = HttpClient::new(timeout)?.with_token(config.api_token.as_deref());

        let mut collection_url = Url::parse(config.base_url.trim())
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        collection_url
            .path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(config.base_url.clone()))?
            .pop_if_empty()
            .extend(config.collection.split('/').filter(|s| !s.is_empty()));

        Ok(Self {
            http,
            collection_url,
        })
    }

    fn document_url(&self, key: &str) -> String {
        let mut url = self.collection_url.clone();
        // `new` only accepts URLs that can carry path segments
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(key);
        }
        url.into()
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, ApiError> {
        self.http.get_optional_json(&self.document_url(key)).await
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), ApiError> {
        self.http.put_json(&self.document_url(key), &document).await
    }

    async fn delete(&self, key: &str) -> Result<(), ApiError> {
        self.http.delete(&self.document_url(key)).await
    }

    async fn keys(&self) -> Result<Vec<String>, ApiError> {
        let response: KeysResponse = self.http.get_json(self.collection_url.as_str(), &[]).await?;
        Ok(match response {
            KeysResponse::Bare(keys) => keys,
            KeysResponse::Wrapped { keys } => keys,
        })
    }
}

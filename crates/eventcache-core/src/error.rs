use std::path::PathBuf;

use thiserror::Error;

use crate::api::ApiError;

/// Errors surfaced by the cache tiers.
///
/// Read-side errors never reach lookup callers: the store turns them into a
/// miss at the failing tier and falls through to the next one.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to parse cached entry {name}: {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read cache file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Listing source unavailable for {region}/{category}: {source}")]
    SourceUnavailable {
        region: String,
        category: String,
        #[source]
        source: ApiError,
    },

    #[error("Cache write failed: {0}")]
    CacheWrite(#[from] CacheError),
}

impl Error {
    /// True when the failure came from the listing source (including timeouts).
    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, Error::SourceUnavailable { .. })
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{CacheKey, Record};
use crate::error::Error;
use crate::utils::format_age;

/// Snapshot of one key's records at the moment they were fetched.
///
/// Entries are never mutated after construction: a refresh builds a new
/// entry and replaces the old one in every tier. `count` is denormalized from
/// `records` and recomputed whenever an entry is loaded back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredEntry")]
pub struct CacheEntry {
    region: String,
    category: String,
    records: Vec<Record>,
    cached_at: DateTime<Utc>,
    count: usize,
}

/// On-disk/remote shape. `count` is accepted but not trusted.
#[derive(Deserialize)]
struct StoredEntry {
    region: String,
    category: String,
    #[serde(default)]
    records: Vec<Record>,
    cached_at: DateTime<Utc>,
}

impl From<StoredEntry> for CacheEntry {
    fn from(stored: StoredEntry) -> Self {
        Self::with_timestamp(stored.region, stored.category, stored.records, stored.cached_at)
    }
}

impl CacheEntry {
    pub fn new(
        region: impl Into<String>,
        category: impl Into<String>,
        records: Vec<Record>,
    ) -> Self {
        Self::with_timestamp(region, category, records, Utc::now())
    }

    pub fn with_timestamp(
        region: impl Into<String>,
        category: impl Into<String>,
        records: Vec<Record>,
        cached_at: DateTime<Utc>,
    ) -> Self {
        let count = records.len();
        Self {
            region: region.into(),
            category: category.into(),
            records,
            cached_at,
            count,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The key this entry belongs under.
    pub fn key(&self) -> Result<CacheKey, Error> {
        CacheKey::new(&self.region, Some(&self.category))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        format_age(self.age(now).num_minutes())
    }

    /// Fresh iff strictly younger than `ttl`.
    pub fn is_valid(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) < ttl
    }
}

/// The highlight feed: the top record of each region crawled in the last
/// scheduler cycle. Like [`CacheEntry`], `count` is recomputed on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredPopular")]
pub struct PopularEntry {
    pub records: Vec<Record>,
    pub cities_crawled: Vec<String>,
    pub cached_at: DateTime<Utc>,
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub count: usize,
}

#[derive(Deserialize)]
struct StoredPopular {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    cities_crawled: Vec<String>,
    cached_at: DateTime<Utc>,
    #[serde(default)]
    next_crawl_at: Option<DateTime<Utc>>,
}

impl From<StoredPopular> for PopularEntry {
    fn from(stored: StoredPopular) -> Self {
        Self::new(
            stored.records,
            stored.cities_crawled,
            stored.cached_at,
            stored.next_crawl_at,
        )
    }
}

impl PopularEntry {
    pub fn new(
        records: Vec<Record>,
        cities_crawled: Vec<String>,
        cached_at: DateTime<Utc>,
        next_crawl_at: Option<DateTime<Utc>>,
    ) -> Self {
        let count = records.len();
        Self {
            records,
            cities_crawled,
            cached_at,
            next_crawl_at,
            count,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.cached_at < ttl
    }
}

//! Lookup with stale-while-revalidate on top of the tiered store.
//!
//! The orchestrator is the only component callers use directly. A lookup
//! serves a fresh entry as is, serves a stale entry immediately while a
//! background task refreshes it, and blocks on the listing source only when
//! no tier holds the key at all.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ListingSource};
use crate::cache::TieredStore;
use crate::error::Error;
use crate::filter::filter_past;
use crate::models::{CacheEntry, CacheKey, PopularEntry, Record};
use crate::tasks::BackgroundTasks;
use crate::utils::lock;

/// Point-in-time copy of the lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookupMetrics {
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub cold_misses: u64,
    pub refreshes_spawned: u64,
    pub refreshes_deduplicated: u64,
    pub fetch_failures: u64,
}

#[derive(Default)]
struct Counters {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    cold_misses: AtomicU64,
    refreshes_spawned: AtomicU64,
    refreshes_deduplicated: AtomicU64,
    fetch_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LookupMetrics {
        LookupMetrics {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            cold_misses: self.cold_misses.load(Ordering::Relaxed),
            refreshes_spawned: self.refreshes_spawned.load(Ordering::Relaxed),
            refreshes_deduplicated: self.refreshes_deduplicated.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of pre-warming one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub fetched: usize,
    /// Categories that already had a valid entry.
    pub skipped: usize,
    pub failed: usize,
}

/// A stored refresh result plus the number of records the source returned
/// before past listings were dropped.
pub(crate) struct Refreshed {
    pub(crate) entry: Arc<CacheEntry>,
    pub(crate) fetched: usize,
}

struct Inner {
    store: Arc<TieredStore>,
    source: Arc<dyn ListingSource>,
    fetch_timeout: Duration,
    max_concurrent: usize,
    /// Keys with a background refresh in flight.
    refreshing: Mutex<HashSet<CacheKey>>,
    /// Cold fetches in progress, one per key.
    cold_flights: Mutex<HashMap<CacheKey, Arc<ColdFlight>>>,
    refreshes: BackgroundTasks,
    permits: Arc<Semaphore>,
    counters: Counters,
}

/// One cold fetch shared by every caller that missed the same key.
///
/// The first caller to take the lock fetches and leaves its outcome in the
/// slot; callers queued behind it read the outcome instead of fetching again.
/// A failure is kept as its message since `Error` is not `Clone`.
#[derive(Default)]
struct ColdFlight {
    outcome: tokio::sync::Mutex<Option<Result<Arc<CacheEntry>, String>>>,
}

/// Marks a key as refreshing until dropped.
struct InFlight {
    inner: Arc<Inner>,
    key: CacheKey,
}

impl InFlight {
    fn acquire(inner: &Arc<Inner>, key: &CacheKey) -> Option<Self> {
        if lock(&inner.refreshing).insert(key.clone()) {
            Some(Self {
                inner: Arc::clone(inner),
                key: key.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.inner.refreshing).remove(&self.key);
    }
}

/// Cheap to clone; clones share the store, source, counters and task set.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<TieredStore>,
        source: Arc<dyn ListingSource>,
        fetch_timeout: Duration,
        max_concurrent_refreshes: usize,
    ) -> Self {
        let max_concurrent = max_concurrent_refreshes.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                fetch_timeout,
                max_concurrent,
                refreshing: Mutex::new(HashSet::new()),
                cold_flights: Mutex::new(HashMap::new()),
                refreshes: BackgroundTasks::new("refreshes"),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.inner.store
    }

    pub fn source(&self) -> &Arc<dyn ListingSource> {
        &self.inner.source
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn metrics(&self) -> LookupMetrics {
        self.inner.counters.snapshot()
    }

    /// Records for (region, category), fresh or stale.
    ///
    /// Fails only when no tier holds the key and the listing source fails.
    pub async fn lookup(&self, region: &str, category: Option<&str>) -> Result<Vec<Record>, Error> {
        let entry = self.lookup_entry(region, category).await?;
        Ok(entry.records().to_vec())
    }

    /// Like [`lookup`](Self::lookup) but returns the whole entry, so the
    /// caller can inspect `cached_at`.
    pub async fn lookup_entry(
        &self,
        region: &str,
        category: Option<&str>,
    ) -> Result<Arc<CacheEntry>, Error> {
        let key = CacheKey::new(region, category)?;
        let store = &self.inner.store;
        let counters = &self.inner.counters;

        match store.get(&key).await {
            Some(entry) if store.is_valid(&entry) => {
                Counters::bump(&counters.fresh_hits);
                debug!(key = %key, age = %entry.age_display(store.now()), "Fresh hit");
                Ok(entry)
            }
            Some(entry) => {
                Counters::bump(&counters.stale_hits);
                debug!(key = %key, age = %entry.age_display(store.now()), "Stale hit, serving while revalidating");
                self.spawn_refresh(&key);
                Ok(entry)
            }
            None => {
                Counters::bump(&counters.cold_misses);
                debug!(key = %key, "Cold miss");
                self.cold_fetch(&key).await
            }
        }
    }

    /// Fetch (region, category) from the source, drop past listings, store
    /// the result in every tier and return the stored records.
    pub async fn fetch_and_store(
        &self,
        region: &str,
        category: Option<&str>,
    ) -> Result<Vec<Record>, Error> {
        let key = CacheKey::new(region, category)?;
        let refreshed = self.refresh(&key).await?;
        Ok(refreshed.entry.records().to_vec())
    }

    /// Queue a background refresh for (region, category).
    /// Returns `false` if one is already in flight for that key.
    pub fn background_refresh(&self, region: &str, category: Option<&str>) -> Result<bool, Error> {
        let key = CacheKey::new(region, category)?;
        Ok(self.spawn_refresh(&key))
    }

    /// Queue a background refresh for `key` unless one is already running.
    /// Failures are logged; the existing entry stays authoritative.
    pub fn spawn_refresh(&self, key: &CacheKey) -> bool {
        let Some(guard) = InFlight::acquire(&self.inner, key) else {
            Counters::bump(&self.inner.counters.refreshes_deduplicated);
            debug!(key = %key, "Refresh already in flight");
            return false;
        };
        Counters::bump(&self.inner.counters.refreshes_spawned);

        let this = self.clone();
        let key = key.clone();
        self.inner.refreshes.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = Arc::clone(&this.inner.permits).acquire_owned().await else {
                return;
            };
            match this.refresh(&key).await {
                Ok(refreshed) => {
                    debug!(key = %key, count = refreshed.entry.count(), "Background refresh complete")
                }
                Err(e) => warn!(key = %key, error = %e, "Background refresh failed, keeping stale entry"),
            }
        });
        true
    }

    /// Fetch every known category for `region` that has no valid entry yet.
    pub async fn warm_all_categories(&self, region: &str) -> Result<WarmReport, Error> {
        CacheKey::new(region, None)?;
        let mut keys = self
            .inner
            .source
            .supported_categories()
            .iter()
            .map(|category| CacheKey::new(region, Some(category)))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort();
        keys.dedup();

        let mut report = WarmReport::default();
        let mut pending = Vec::new();
        for key in keys {
            if self.inner.store.contains_valid(&key).await {
                report.skipped += 1;
            } else {
                pending.push(key);
            }
        }

        let results: Vec<Result<Arc<CacheEntry>, Error>> = stream::iter(pending)
            .map(|key| async move { self.cold_fetch(&key).await })
            .buffer_unordered(self.inner.max_concurrent)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(_) => report.fetched += 1,
                Err(e) => {
                    warn!(region, error = %e, "Pre-warm fetch failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            region,
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            "Pre-warmed region"
        );
        Ok(report)
    }

    pub async fn popular(&self) -> Option<Arc<PopularEntry>> {
        self.inner.store.get_popular().await
    }

    /// Wait for background refreshes and the remote writes they queued.
    pub async fn drain(&self) {
        self.inner.refreshes.drain().await;
        self.inner.store.flush().await;
    }

    /// Wait up to `grace` for background work, then abort what is left.
    /// Returns `true` if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let refreshes_done = self.inner.refreshes.shutdown(grace).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let writes_done = self.inner.store.shutdown(remaining).await;
        refreshes_done && writes_done
    }

    // ===== Internals =====

    /// Single-flight fetch for a key nobody has: the first caller fetches,
    /// the others wait for it and share its outcome, failures included.
    async fn cold_fetch(&self, key: &CacheKey) -> Result<Arc<CacheEntry>, Error> {
        let flight = self.cold_flight(key);
        let mut outcome = flight.outcome.lock().await;

        if let Some(shared) = outcome.as_ref() {
            debug!(key = %key, "Sharing the outcome of a concurrent fetch");
            return shared.clone().map_err(|reason| Error::SourceUnavailable {
                region: key.region().to_string(),
                category: key.category().to_string(),
                source: ApiError::Unavailable(reason),
            });
        }

        let result = match self.inner.store.get(key).await {
            Some(entry) if self.inner.store.is_valid(&entry) => {
                debug!(key = %key, "Filled by a concurrent fetch");
                Ok(entry)
            }
            _ => self.refresh(key).await.map(|refreshed| refreshed.entry),
        };

        *outcome = Some(match &result {
            Ok(entry) => Ok(Arc::clone(entry)),
            Err(Error::SourceUnavailable { source, .. }) => Err(source.to_string()),
            Err(e) => Err(e.to_string()),
        });
        self.finish_cold_flight(key, &flight);
        drop(outcome);
        result
    }

    fn cold_flight(&self, key: &CacheKey) -> Arc<ColdFlight> {
        Arc::clone(lock(&self.inner.cold_flights).entry(key.clone()).or_default())
    }

    /// Later callers start a new flight; those already queued keep their
    /// handle and read the stored outcome.
    fn finish_cold_flight(&self, key: &CacheKey, flight: &Arc<ColdFlight>) {
        let mut flights = lock(&self.inner.cold_flights);
        if flights.get(key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
            flights.remove(key);
        }
    }

    pub(crate) async fn refresh_pair(&self, region: &str, category: &str) -> Result<Refreshed, Error> {
        let key = CacheKey::new(region, Some(category))?;
        self.refresh(&key).await
    }

    async fn refresh(&self, key: &CacheKey) -> Result<Refreshed, Error> {
        let inner = &self.inner;
        let started = Instant::now();

        let fetched = match tokio::time::timeout(
            inner.fetch_timeout,
            inner.source.fetch(key.region(), key.category()),
        )
        .await
        {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => return Err(self.source_failure(key, e)),
            Err(_) => return Err(self.source_failure(key, ApiError::Timeout(inner.fetch_timeout))),
        };

        let fetched_count = fetched.len();
        let now = inner.store.now();
        let records = filter_past(fetched, now);
        let entry = CacheEntry::with_timestamp(key.region(), key.category(), records, now);

        let stored = match inner.store.put(key, entry) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist entry, serving it from memory");
                inner.store.get(key).await.ok_or(Error::CacheWrite(e))?
            }
        };

        info!(
            key = %key,
            fetched = fetched_count,
            cached = stored.count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched and stored listings"
        );
        Ok(Refreshed {
            entry: stored,
            fetched: fetched_count,
        })
    }

    fn source_failure(&self, key: &CacheKey, source: ApiError) -> Error {
        Counters::bump(&self.inner.counters.fetch_failures);
        debug!(key = %key, error = %source, "Listing source failed");
        Error::SourceUnavailable {
            region: key.region().to_string(),
            category: key.category().to_string(),
            source,
        }
    }
}

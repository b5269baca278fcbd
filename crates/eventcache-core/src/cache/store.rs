//! Three-tier cache store: memory, local disk, shared remote.
//!
//! Reads check the tiers in order and promote a hit into every faster tier.
//! A failing tier (unreadable file, corrupt document, unreachable remote) is
//! a miss at that tier only. Writes update memory and disk before returning
//! and push to the remote tier in the background.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{DiskTier, MemoryTier, RemoteStore};
use crate::clock::{Clock, SystemClock};
use crate::error::CacheError;
use crate::models::{CacheEntry, CacheKey, PopularEntry};
use crate::tasks::BackgroundTasks;
use crate::utils::lock;

/// Document name of the popular feed in the disk and remote tiers.
/// Rendered cache keys never start with `_`.
pub const POPULAR_KEY: &str = "_popular";

/// Write lock for one remote document, holding the newest `cached_at` this
/// process has written to it.
type RemoteSlot = Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>;

/// Total vs. still-fresh entries in one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub total: usize,
    pub valid: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub memory: TierStats,
    /// `None` when the store has no disk tier.
    pub disk: Option<TierStats>,
    /// `None` when the remote tier is unconfigured or unreachable.
    pub remote: Option<TierStats>,
    pub disk_bytes: u64,
    pub ttl_hours: f64,
    pub cache_dir: Option<PathBuf>,
}

/// Entries evicted per tier by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory: usize,
    pub disk: usize,
    pub remote: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.memory + self.disk + self.remote
    }
}

pub struct TieredStoreBuilder {
    ttl: Duration,
    disk_dir: Option<PathBuf>,
    remote: Option<Arc<dyn RemoteStore>>,
    clock: Arc<dyn Clock>,
}

impl TieredStoreBuilder {
    pub fn disk(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_dir = Some(dir.into());
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<TieredStore, CacheError> {
        let disk = self.disk_dir.map(DiskTier::new).transpose()?;
        info!(
            ttl_hours = self.ttl.num_minutes() as f64 / 60.0,
            disk = ?disk.as_ref().map(|d| d.dir()),
            remote = self.remote.is_some(),
            "Cache store initialized"
        );
        Ok(TieredStore {
            memory: MemoryTier::new(),
            disk,
            remote: self.remote,
            ttl: self.ttl,
            clock: self.clock,
            remote_writes: BackgroundTasks::new("remote-writes"),
            disk_writes: Mutex::new(()),
            remote_slots: Mutex::new(HashMap::new()),
        })
    }
}

pub struct TieredStore {
    memory: MemoryTier,
    disk: Option<DiskTier>,
    remote: Option<Arc<dyn RemoteStore>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    remote_writes: BackgroundTasks,
    /// Serializes disk writes with the sweep's check-then-remove.
    disk_writes: Mutex<()>,
    remote_slots: Mutex<HashMap<String, RemoteSlot>>,
}

impl TieredStore {
    pub fn builder(ttl: Duration) -> TieredStoreBuilder {
        TieredStoreBuilder {
            ttl,
            disk_dir: None,
            remote: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn is_valid(&self, entry: &CacheEntry) -> bool {
        entry.is_valid(self.now(), self.ttl)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    // ===== Reads =====

    /// Look a key up in memory, then disk, then remote, promoting hits.
    /// Returns the entry whether fresh or stale.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.memory.get(key) {
            debug!(key = %key, "Memory hit");
            return Some(entry);
        }

        if let Some(disk) = &self.disk {
            match disk.load_entry(key) {
                Ok(Some(entry)) => {
                    debug!(key = %key, "Disk hit, promoting to memory");
                    return Some(self.memory.promote(key.clone(), Arc::new(entry)));
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Disk tier read failed, treating as miss"),
            }
        }

        let entry: CacheEntry = self.load_remote(&key.to_string()).await?;
        debug!(key = %key, "Remote hit, promoting to memory and disk");
        if let Some(disk) = &self.disk {
            let _guard = lock(&self.disk_writes);
            if let Err(e) = disk.save_entry(key, &entry) {
                warn!(key = %key, error = %e, "Failed to promote remote entry to disk");
            }
        }
        Some(self.memory.promote(key.clone(), Arc::new(entry)))
    }

    /// True iff some tier holds a fresh entry for `key`.
    pub async fn contains_valid(&self, key: &CacheKey) -> bool {
        match self.get(key).await {
            Some(entry) => self.is_valid(&entry),
            None => false,
        }
    }

    /// Remote read that degrades every failure to a miss.
    async fn load_remote<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let remote = self.remote.as_ref()?;
        match remote.get(name).await {
            Ok(Some(document)) => match serde_json::from_value(document) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(key = name, error = %e, "Corrupt remote document, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = name, error = %e, "Remote tier unavailable, treating as miss");
                None
            }
        }
    }

    // ===== Writes =====

    /// Store `entry` under `key`.
    ///
    /// Memory is updated first, so the next `get` sees the entry even if the
    /// disk write fails (that failure is returned for the caller to log). The
    /// remote write is queued in the background; it needs a Tokio runtime.
    pub fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<Arc<CacheEntry>, CacheError> {
        let entry = Arc::new(entry);
        self.memory.insert(key.clone(), Arc::clone(&entry));
        self.push_remote(key.to_string(), entry.cached_at(), &*entry);

        if let Some(disk) = &self.disk {
            let _guard = lock(&self.disk_writes);
            disk.save_entry(key, &entry)?;
        }
        debug!(key = %key, count = entry.count(), "Stored entry");
        Ok(entry)
    }

    /// Queue a remote write. Writes to one document are serialized, and one
    /// older than what this process already wrote there is dropped, so the
    /// newest entry wins even when writes complete out of order.
    fn push_remote<T: Serialize>(&self, name: String, cached_at: DateTime<Utc>, data: &T) {
        let Some(remote) = &self.remote else {
            return;
        };
        let document = match serde_json::to_value(data) {
            Ok(document) => document,
            Err(e) => {
                warn!(key = %name, error = %e, "Failed to serialize entry for remote tier");
                return;
            }
        };
        let remote = Arc::clone(remote);
        let slot = self.remote_slot(&name);
        self.remote_writes.spawn(async move {
            let mut newest = slot.lock().await;
            if newest.is_some_and(|written| written > cached_at) {
                debug!(key = %name, "Remote document already newer, skipping write");
                return;
            }
            match remote.put(&name, document).await {
                Ok(()) => *newest = Some(cached_at),
                Err(e) => warn!(key = %name, error = %e, "Remote tier write failed"),
            }
        });
    }

    fn remote_slot(&self, name: &str) -> RemoteSlot {
        Arc::clone(lock(&self.remote_slots).entry(name.to_string()).or_default())
    }

    // ===== Popular feed =====

    pub async fn get_popular(&self) -> Option<Arc<PopularEntry>> {
        if let Some(entry) = self.memory.popular() {
            return Some(entry);
        }

        if let Some(disk) = &self.disk {
            match disk.load::<PopularEntry>(POPULAR_KEY) {
                Ok(Some(entry)) => {
                    let entry = Arc::new(entry);
                    self.memory.set_popular(Arc::clone(&entry));
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to load popular feed from disk"),
            }
        }

        let entry: PopularEntry = self.load_remote(POPULAR_KEY).await?;
        if let Some(disk) = &self.disk {
            let _guard = lock(&self.disk_writes);
            if let Err(e) = disk.save(POPULAR_KEY, &entry) {
                warn!(error = %e, "Failed to promote popular feed to disk");
            }
        }
        let entry = Arc::new(entry);
        self.memory.set_popular(Arc::clone(&entry));
        Some(entry)
    }

    pub fn put_popular(&self, entry: PopularEntry) -> Result<Arc<PopularEntry>, CacheError> {
        let entry = Arc::new(entry);
        self.memory.set_popular(Arc::clone(&entry));
        self.push_remote(POPULAR_KEY.to_string(), entry.cached_at, &*entry);
        if let Some(disk) = &self.disk {
            let _guard = lock(&self.disk_writes);
            disk.save(POPULAR_KEY, &*entry)?;
        }
        Ok(entry)
    }

    // ===== Housekeeping =====

    /// Evict expired entries (and unreadable documents) from every tier.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.now();
        let ttl = self.ttl;
        let mut report = SweepReport {
            memory: self.memory.retain(|entry| entry.is_valid(now, ttl)),
            ..SweepReport::default()
        };
        if let Some(popular) = self.memory.popular() {
            if !popular.is_valid(now, ttl) && self.memory.clear_popular() {
                report.memory += 1;
            }
        }

        if let Some(disk) = &self.disk {
            report.disk = self.sweep_disk(disk, now);
        }
        if let Some(remote) = &self.remote {
            report.remote = self.sweep_remote(remote.as_ref(), now).await;
        }

        if report.total() > 0 {
            info!(
                memory = report.memory,
                disk = report.disk,
                remote = report.remote,
                "Swept expired cache entries"
            );
        }
        report
    }

    fn sweep_disk(&self, disk: &DiskTier, now: DateTime<Utc>) -> usize {
        let names = match disk.names() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list disk tier for sweep");
                return 0;
            }
        };

        let mut evicted = 0;
        for name in names {
            let seen = match stored_on_disk(disk, &name) {
                Ok(seen) => seen,
                Err(e) => {
                    warn!(key = %name, error = %e, "Skipping cache file during sweep");
                    continue;
                }
            };
            if !seen.expired(now, self.ttl) {
                continue;
            }
            if seen == Stored::Corrupt {
                warn!(key = %name, "Removing unreadable cache file");
            }
            if self.remove_disk_if_unchanged(disk, &name, seen) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove `name` only if it still holds what the sweep inspected. A put
    /// that landed in between is kept.
    fn remove_disk_if_unchanged(&self, disk: &DiskTier, name: &str, seen: Stored) -> bool {
        let _guard = lock(&self.disk_writes);
        match stored_on_disk(disk, name) {
            Ok(current) if current == seen => match disk.remove(name) {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(key = %name, error = %e, "Failed to remove expired cache file");
                    false
                }
            },
            Ok(_) => {
                debug!(key = %name, "Cache file rewritten during sweep, keeping it");
                false
            }
            Err(e) => {
                warn!(key = %name, error = %e, "Failed to re-read cache file during sweep");
                false
            }
        }
    }

    async fn sweep_remote(&self, remote: &dyn RemoteStore, now: DateTime<Utc>) -> usize {
        let keys = match remote.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Remote tier unavailable, skipping remote sweep");
                return 0;
            }
        };

        let mut evicted = 0;
        for key in keys {
            let seen = match remote.get(&key).await {
                Ok(Some(document)) => parse_stored(&key, document),
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Remote read failed during sweep");
                    continue;
                }
            };
            if seen.expired(now, self.ttl) && self.delete_remote_if_unchanged(remote, &key, seen).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Delete a remote document only if it still holds what the sweep
    /// inspected. Holds the document's write slot, so queued writes from this
    /// process land after the delete.
    async fn delete_remote_if_unchanged(&self, remote: &dyn RemoteStore, key: &str, seen: Stored) -> bool {
        let slot = self.remote_slot(key);
        let _write = slot.lock().await;

        let current = match remote.get(key).await {
            Ok(Some(document)) => parse_stored(key, document),
            Ok(None) => return false,
            Err(e) => {
                warn!(key = %key, error = %e, "Remote read failed during sweep");
                return false;
            }
        };
        if current != seen {
            debug!(key = %key, "Remote document rewritten during sweep, keeping it");
            return false;
        }
        match remote.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete expired remote document");
                false
            }
        }
    }

    /// Per-tier totals and fresh counts. The popular feed is not counted.
    pub async fn stats(&self) -> StoreStats {
        let now = self.now();
        let memory_entries = self.memory.entries();
        let memory = TierStats {
            total: memory_entries.len(),
            valid: memory_entries
                .iter()
                .filter(|e| e.is_valid(now, self.ttl))
                .count(),
        };

        let disk = self.disk.as_ref().map(|disk| {
            let names = disk.names().unwrap_or_default();
            let mut stats = TierStats::default();
            for name in names.iter().filter(|n| n.as_str() != POPULAR_KEY) {
                stats.total += 1;
                if let Ok(Some(entry)) = disk.load::<CacheEntry>(name) {
                    if entry.is_valid(now, self.ttl) {
                        stats.valid += 1;
                    }
                }
            }
            stats
        });

        let remote = match &self.remote {
            Some(remote) => self.remote_stats(remote.as_ref(), now).await,
            None => None,
        };

        StoreStats {
            memory,
            disk,
            remote,
            disk_bytes: self.disk.as_ref().map_or(0, |d| d.size_bytes()),
            ttl_hours: self.ttl.num_minutes() as f64 / 60.0,
            cache_dir: self.disk.as_ref().map(|d| d.dir().to_path_buf()),
        }
    }

    async fn remote_stats(&self, remote: &dyn RemoteStore, now: DateTime<Utc>) -> Option<TierStats> {
        let keys = match remote.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                debug!(error = %e, "Remote tier unavailable for stats");
                return None;
            }
        };

        let mut stats = TierStats::default();
        for key in keys.iter().filter(|k| k.as_str() != POPULAR_KEY) {
            stats.total += 1;
            if let Ok(Some(document)) = remote.get(key).await {
                if !parse_stored(key, document).expired(now, self.ttl) {
                    stats.valid += 1;
                }
            }
        }
        Some(stats)
    }

    /// Wait for queued remote writes to finish.
    pub async fn flush(&self) {
        self.remote_writes.drain().await;
    }

    /// Wait up to `grace` for queued remote writes, then drop them.
    pub async fn shutdown(&self, grace: StdDuration) -> bool {
        self.remote_writes.shutdown(grace).await
    }
}

/// A stored document as seen by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stored {
    Missing,
    Corrupt,
    CachedAt(DateTime<Utc>),
}

impl Stored {
    /// Corrupt documents count as expired; missing ones never do.
    fn expired(self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self {
            Stored::Missing => false,
            Stored::Corrupt => true,
            Stored::CachedAt(cached_at) => now - cached_at >= ttl,
        }
    }
}

fn parse_stored(name: &str, document: Value) -> Stored {
    let cached_at = if name == POPULAR_KEY {
        serde_json::from_value::<PopularEntry>(document).map(|e| e.cached_at)
    } else {
        serde_json::from_value::<CacheEntry>(document).map(|e| e.cached_at())
    };
    cached_at.map_or(Stored::Corrupt, Stored::CachedAt)
}

fn stored_on_disk(disk: &DiskTier, name: &str) -> Result<Stored, CacheError> {
    match disk.load::<Value>(name) {
        Ok(Some(document)) => Ok(parse_stored(name, document)),
        Ok(None) => Ok(Stored::Missing),
        Err(CacheError::Serialization { .. }) => Ok(Stored::Corrupt),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemoteStore;
    use crate::clock::ManualClock;
    use crate::test_support::record_starting;
    use tempfile::TempDir;

    struct Fixture {
        store: TieredStore,
        remote: Arc<InMemoryRemoteStore>,
        clock: Arc<ManualClock>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let remote = Arc::new(InMemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = TieredStore::builder(Duration::hours(6))
            .disk(dir.path().join("cache"))
            .remote(remote.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture {
            store,
            remote,
            clock,
            dir,
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("paris", Some("music")).unwrap()
    }

    fn entry_at(cached_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::with_timestamp(
            "paris",
            "music",
            vec![record_starting("2030-01-01"), record_starting("2030-02-01")],
            cached_at,
        )
    }

    #[tokio::test]
    async fn test_put_writes_every_tier() {
        let f = fixture();
        let entry = entry_at(f.clock.now());

        f.store.put(&key(), entry.clone()).unwrap();
        f.store.flush().await;

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert!(f.dir.path().join("cache/paris__music.json").exists());
        let remote_doc = f.remote.document("paris__music").unwrap();
        assert_eq!(serde_json::from_value::<CacheEntry>(remote_doc).unwrap(), entry);
    }

    #[tokio::test]
    async fn test_put_twice_is_idempotent() {
        let f = fixture();
        let entry = entry_at(f.clock.now());

        f.store.put(&key(), entry.clone()).unwrap();
        f.store.put(&key(), entry.clone()).unwrap();
        f.store.flush().await;

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert_eq!(f.store.stats().await.memory.total, 1);
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_to_memory() {
        let f = fixture();
        let entry = entry_at(f.clock.now());
        DiskTier::new(f.dir.path().join("cache"))
            .unwrap()
            .save_entry(&key(), &entry)
            .unwrap();

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert_eq!(f.store.memory.get(&key()).as_deref(), Some(&entry));
        assert_eq!(f.remote.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_hit_promotes_and_next_get_skips_remote() {
        let f = fixture();
        let entry = entry_at(f.clock.now());
        f.remote
            .insert_raw("paris__music", serde_json::to_value(&entry).unwrap());

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert_eq!(f.remote.get_calls(), 1);
        assert!(f.dir.path().join("cache/paris__music.json").exists());

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert_eq!(f.remote.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_disk_file_falls_through_to_remote() {
        let f = fixture();
        let entry = entry_at(f.clock.now());
        std::fs::write(f.dir.path().join("cache/paris__music.json"), "garbage").unwrap();
        f.remote
            .insert_raw("paris__music", serde_json::to_value(&entry).unwrap());

        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        // The promotion rewrote the corrupt file
        let disk = DiskTier::new(f.dir.path().join("cache")).unwrap();
        assert_eq!(disk.load_entry(&key()).unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_a_miss() {
        let f = fixture();
        f.remote.set_offline(true);

        assert!(f.store.get(&key()).await.is_none());

        // Writes still succeed from the caller's point of view
        let entry = entry_at(f.clock.now());
        f.store.put(&key(), entry.clone()).unwrap();
        f.store.flush().await;
        assert_eq!(f.store.get(&key()).await.as_deref(), Some(&entry));
        assert!(f.store.stats().await.remote.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_remote_document_is_a_miss() {
        let f = fixture();
        f.remote.insert_raw("paris__music", serde_json::json!({"region": 3}));
        assert!(f.store.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_only_store() {
        let store = TieredStore::builder(Duration::hours(1)).build().unwrap();
        let entry = entry_at(Utc::now());
        store.put(&key(), entry.clone()).unwrap();

        assert_eq!(store.get(&key()).await.as_deref(), Some(&entry));
        let stats = store.stats().await;
        assert!(stats.disk.is_none());
        assert!(stats.remote.is_none());
        assert_eq!(stats.memory, TierStats { total: 1, valid: 1 });
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_from_every_tier() {
        let f = fixture();
        let fresh_key = CacheKey::new("london", None).unwrap();
        let now = f.clock.now();

        f.store.put(&key(), entry_at(now - Duration::hours(7))).unwrap();
        f.store
            .put(&fresh_key, CacheEntry::with_timestamp("london", "all", vec![], now))
            .unwrap();
        f.remote.insert_raw("broken__doc", serde_json::json!("nope"));
        f.store.flush().await;

        let before = f.store.stats().await;
        assert_eq!(before.memory, TierStats { total: 2, valid: 1 });
        assert_eq!(before.disk, Some(TierStats { total: 2, valid: 1 }));
        assert_eq!(before.remote, Some(TierStats { total: 3, valid: 1 }));

        let report = f.store.sweep().await;
        assert_eq!(report, SweepReport { memory: 1, disk: 1, remote: 2 });

        assert!(f.store.get(&key()).await.is_none());
        assert!(f.store.get(&fresh_key).await.is_some());
        assert_eq!(f.remote.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_still_returned() {
        let f = fixture();
        f.store.put(&key(), entry_at(f.clock.now())).unwrap();
        f.clock.advance(Duration::hours(6) + Duration::seconds(1));

        let entry = f.store.get(&key()).await.unwrap();
        assert!(!f.store.is_valid(&entry));
        assert!(!f.store.contains_valid(&key()).await);
    }

    #[tokio::test]
    async fn test_popular_round_trip_and_promotion() {
        let f = fixture();
        let popular = PopularEntry::new(
            vec![record_starting("2030-01-01")],
            vec!["paris".to_string()],
            f.clock.now(),
            Some(f.clock.now() + Duration::hours(4)),
        );

        f.store.put_popular(popular.clone()).unwrap();
        f.store.flush().await;
        assert_eq!(f.store.get_popular().await.as_deref(), Some(&popular));

        // A second instance sharing only the remote tier sees it too
        let other_dir = TempDir::new().unwrap();
        let other = TieredStore::builder(Duration::hours(6))
            .disk(other_dir.path())
            .remote(f.remote.clone())
            .build()
            .unwrap();
        assert_eq!(other.get_popular().await.as_deref(), Some(&popular));
        assert!(other_dir.path().join("_popular.json").exists());
    }

    #[tokio::test]
    async fn test_remote_keeps_newest_of_racing_writes() {
        let f = fixture();
        let now = f.clock.now();
        let newer = entry_at(now);

        // Both writes are queued before either runs; the older one lands last
        f.store.put(&key(), newer.clone()).unwrap();
        f.store.put(&key(), entry_at(now - Duration::minutes(5))).unwrap();
        f.store.flush().await;

        let remote_doc = f.remote.document("paris__music").unwrap();
        assert_eq!(serde_json::from_value::<CacheEntry>(remote_doc).unwrap(), newer);
    }

    #[tokio::test]
    async fn test_sweep_keeps_documents_rewritten_after_inspection() {
        let f = fixture();
        let now = f.clock.now();
        let name = key().to_string();
        f.store.put(&key(), entry_at(now - Duration::hours(7))).unwrap();
        f.store.flush().await;

        let disk = f.store.disk.as_ref().unwrap();
        let seen_on_disk = stored_on_disk(disk, &name).unwrap();
        let seen_remote = parse_stored(&name, f.remote.document(&name).unwrap());
        assert!(seen_on_disk.expired(now, f.store.ttl()));
        assert!(seen_remote.expired(now, f.store.ttl()));

        // A refresh lands between inspection and removal
        let fresh = entry_at(now);
        f.store.put(&key(), fresh.clone()).unwrap();
        f.store.flush().await;

        assert!(!f.store.remove_disk_if_unchanged(disk, &name, seen_on_disk));
        assert!(
            !f.store
                .delete_remote_if_unchanged(f.remote.as_ref(), &name, seen_remote)
                .await
        );
        assert_eq!(disk.load_entry(&key()).unwrap(), Some(fresh.clone()));
        assert_eq!(
            serde_json::from_value::<CacheEntry>(f.remote.document(&name).unwrap()).unwrap(),
            fresh
        );

        // What the sweep saw is still there: removed
        let current = stored_on_disk(disk, &name).unwrap();
        assert!(f.store.remove_disk_if_unchanged(disk, &name, current));
        assert!(disk.load_entry(&key()).unwrap().is_none());
    }
}

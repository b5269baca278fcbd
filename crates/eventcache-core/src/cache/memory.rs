use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{CacheEntry, CacheKey, PopularEntry};
use crate::utils::{read, write};

/// Process-lifetime tier. Values are whole `Arc`s, so a reader always sees a
/// complete entry even while a writer replaces it.
#[derive(Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    popular: RwLock<Option<Arc<PopularEntry>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        read(&self.entries).get(key).cloned()
    }

    /// Unconditional replace; later writes win.
    pub fn insert(&self, key: CacheKey, entry: Arc<CacheEntry>) {
        write(&self.entries).insert(key, entry);
    }

    /// Insert an entry loaded from a slower tier unless memory already holds
    /// one that is at least as new. Returns whichever entry ends up stored.
    pub fn promote(&self, key: CacheKey, entry: Arc<CacheEntry>) -> Arc<CacheEntry> {
        let mut entries = write(&self.entries);
        match entries.get(&key) {
            Some(existing) if existing.cached_at() >= entry.cached_at() => Arc::clone(existing),
            _ => {
                entries.insert(key, Arc::clone(&entry));
                entry
            }
        }
    }

    /// Keep only entries matching `keep`; returns how many were evicted.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut entries = write(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| keep(entry));
        before - entries.len()
    }

    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        read(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn popular(&self) -> Option<Arc<PopularEntry>> {
        read(&self.popular).clone()
    }

    pub fn set_popular(&self, entry: Arc<PopularEntry>) {
        *write(&self.popular) = Some(entry);
    }

    pub fn clear_popular(&self) -> bool {
        write(&self.popular).take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn key() -> CacheKey {
        CacheKey::new("paris", Some("music")).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let tier = MemoryTier::new();
        let entry = Arc::new(CacheEntry::new("paris", "music", vec![]));
        tier.insert(key(), Arc::clone(&entry));
        assert_eq!(tier.get(&key()).as_deref(), Some(&*entry));
    }

    #[test]
    fn test_promote_keeps_newer_entry() {
        let tier = MemoryTier::new();
        let now = Utc::now();
        let newer = Arc::new(CacheEntry::with_timestamp("paris", "music", vec![], now));
        let older = Arc::new(CacheEntry::with_timestamp(
            "paris",
            "music",
            vec![],
            now - Duration::hours(1),
        ));

        tier.insert(key(), Arc::clone(&newer));
        let kept = tier.promote(key(), older);
        assert_eq!(kept.cached_at(), now);
        assert_eq!(tier.get(&key()).unwrap().cached_at(), now);
    }

    #[test]
    fn test_retain_counts_evictions() {
        let tier = MemoryTier::new();
        let now = Utc::now();
        tier.insert(
            key(),
            Arc::new(CacheEntry::with_timestamp("paris", "music", vec![], now - Duration::days(1))),
        );
        tier.insert(
            CacheKey::new("london", None).unwrap(),
            Arc::new(CacheEntry::with_timestamp("london", "all", vec![], now)),
        );

        let evicted = tier.retain(|entry| entry.is_valid(now, Duration::hours(6)));
        assert_eq!(evicted, 1);
        assert_eq!(tier.len(), 1);
        assert!(tier.get(&key()).is_none());
    }
}

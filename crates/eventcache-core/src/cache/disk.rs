use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::CacheError;
use crate::models::{CacheEntry, CacheKey};

const EXTENSION: &str = "json";

/// Local durable tier: one pretty-printed JSON document per key.
///
/// Writes go to a unique temporary file in the same directory and are then
/// renamed over the target, so a reader sees either the old document or the
/// new one, never a prefix.
pub struct DiskTier {
    cache_dir: PathBuf,
    temp_counter: AtomicU64,
}

impl DiskTier {
    pub fn new(cache_dir: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&cache_dir).map_err(|source| CacheError::Write {
            path: cache_dir.clone(),
            source,
        })?;
        Ok(Self {
            cache_dir,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", name, EXTENSION))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.cache_dir
            .join(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CacheError> {
        let path = self.cache_path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Read { path, source }),
        };

        let parsed = serde_json::from_str(&contents).map_err(|source| CacheError::Serialization {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(parsed))
    }

    pub fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<(), CacheError> {
        let contents =
            serde_json::to_string_pretty(data).map_err(|source| CacheError::Serialization {
                name: name.to_string(),
                source,
            })?;

        let temp = self.temp_path(name);
        let target = self.cache_path(name);
        if let Err(source) = std::fs::write(&temp, contents) {
            let _ = std::fs::remove_file(&temp);
            return Err(CacheError::Write { path: temp, source });
        }
        std::fs::rename(&temp, &target).map_err(|source| {
            let _ = std::fs::remove_file(&temp);
            CacheError::Write {
                path: target,
                source,
            }
        })
    }

    /// Remove a document. Returns whether one existed.
    pub fn remove(&self, name: &str) -> Result<bool, CacheError> {
        let path = self.cache_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Write { path, source }),
        }
    }

    /// Names of every stored document (file stems), in sorted order.
    pub fn names(&self) -> Result<Vec<String>, CacheError> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|source| CacheError::Read {
            path: self.cache_dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Total size of stored documents in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.names()
            .unwrap_or_default()
            .iter()
            .filter_map(|name| std::fs::metadata(self.cache_path(name)).ok())
            .map(|meta| meta.len())
            .sum()
    }

    // ===== Entries =====

    pub fn load_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.load(&key.to_string())
    }

    pub fn save_entry(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.save(&key.to_string(), entry)
    }
}

//! Data models for cached listings.
//!
//! - `CacheKey`: normalized (region, category) identity shared by every tier
//! - `CacheEntry`: immutable snapshot of one key's records plus `cached_at`
//! - `PopularEntry`: the site-wide highlight feed, one top record per region
//! - `Record`: an opaque listing; only its start time is ever inspected

pub mod entry;
pub mod key;
pub mod record;

pub use entry::{CacheEntry, PopularEntry};
pub use key::{CacheKey, DEFAULT_CATEGORY};
pub use record::Record;

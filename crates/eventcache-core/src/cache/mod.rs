//! Layered listing storage.
//!
//! - `MemoryTier`: per-process map of shared entries
//! - `DiskTier`: one JSON file per key, survives restarts
//! - `RemoteStore`: shared document store visible to every instance
//! - `TieredStore`: reads through all three with promotion, writes to all three

pub mod disk;
pub mod memory;
pub mod remote;
pub mod store;

pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use remote::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore};
pub use store::{StoreStats, SweepReport, TierStats, TieredStore, TieredStoreBuilder, POPULAR_KEY};

//! Location-keyed cache for perishable listing data.
//!
//! Listings (events per city and category) come from a slow, rate-limited
//! upstream. This crate keeps them in a three-tier cache (memory, local disk,
//! shared remote store), serves stale data while refreshing it in the
//! background, and runs a periodic scheduler that keeps every known
//! (region, category) pair warm.
//!
//! - [`cache::TieredStore`]: layered storage with promotion on read
//! - [`refresh::Orchestrator`]: lookup with stale-while-revalidate
//! - [`refresh::Scheduler`]: periodic refresh of the full cross-product
//! - [`filter::filter_past`]: drops listings that already started
//! - [`api`]: the listing source seam and its HTTP implementation

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod refresh;
pub mod tasks;
pub mod utils;

pub use api::{ApiError, HttpListingSource, ListingSource};
pub use cache::{
    HttpRemoteStore, InMemoryRemoteStore, RemoteStore, StoreStats, SweepReport, TierStats,
    TieredStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{CacheError, Error};
pub use filter::filter_past;
pub use models::{CacheEntry, CacheKey, PopularEntry, Record};
pub use refresh::{
    LookupMetrics, Orchestrator, RefreshSummary, Scheduler, SchedulerConfig, SchedulerHandle,
    WarmReport,
};

#[cfg(test)]
pub(crate) mod test_support;

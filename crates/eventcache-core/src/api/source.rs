use async_trait::async_trait;

use super::ApiError;
use crate::models::Record;

/// The upstream that produces listings.
///
/// Implementations are slow and rate limited; the orchestrator bounds every
/// `fetch` with its own timeout and never calls it for a key that has a
/// valid cached entry.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch the current listings for one (region, category) pair.
    async fn fetch(&self, region: &str, category: &str) -> Result<Vec<Record>, ApiError>;

    /// Regions the scheduler should keep warm.
    fn supported_regions(&self) -> Vec<String>;

    /// Categories the scheduler should keep warm.
    fn supported_categories(&self) -> Vec<String>;
}

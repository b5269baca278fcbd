//! Listing source seam and its HTTP implementation.
//!
//! The cache treats the upstream as an opaque `fetch(region, category)`
//! capability. `HttpListingSource` talks to a normalizing scraper service
//! over REST; tests and embedders can provide their own `ListingSource`.

pub mod client;
pub mod error;
pub mod source;

pub use client::{HttpClient, HttpListingSource};
pub use error::ApiError;
pub use source::ListingSource;

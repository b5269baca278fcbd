use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Category used when the caller does not name one.
pub const DEFAULT_CATEGORY: &str = "all";

/// Separator between the region and category segments.
/// Normalized segments never contain it, so keys parse back unambiguously.
const SEPARATOR: &str = "__";

/// Canonical (region, category) identity.
///
/// Renders as `"{region}__{category}"`, which is also the disk file stem and
/// the remote document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    region: String,
    category: String,
}

impl CacheKey {
    pub fn new(region: &str, category: Option<&str>) -> Result<Self, Error> {
        let normalized_region = normalize_segment(region);
        if normalized_region.is_empty() {
            return Err(Error::InvalidKey(format!(
                "region {:?} is empty after normalization",
                region
            )));
        }

        let normalized_category = category
            .map(normalize_segment)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

        Ok(Self {
            region: normalized_region,
            category: normalized_category,
        })
    }

    /// Parse a rendered key (e.g. a disk file stem) back into its parts.
    pub fn parse(s: &str) -> Option<Self> {
        let (region, category) = s.split_once(SEPARATOR)?;
        let key = Self::new(region, Some(category)).ok()?;
        // Only accept strings that are already canonical
        if key.to_string() == s {
            Some(key)
        } else {
            None
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.region, SEPARATOR, self.category)
    }
}

/// Lower-case, map whitespace and path separators to `_`, collapse runs of
/// `_` and strip them from both ends.
fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        let c = if c.is_whitespace() || c == '/' || c == '\\' {
            '_'
        } else {
            c
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('_').to_string()
}

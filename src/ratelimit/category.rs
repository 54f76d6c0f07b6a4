//! API request categories and their provider-contract limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default sliding window length: 15 minutes.
pub const DEFAULT_WINDOW_SECS: u64 = 15 * 60;
/// Search requests allowed per window.
pub const SEARCH_LIMIT: u32 = 180;
/// Single-item lookups allowed per window.
pub const LOOKUP_LIMIT: u32 = 300;
/// Posts allowed per window.
pub const POST_LIMIT: u32 = 200;

/// A class of API request with its own independent quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestCategory {
    /// Recent-item search
    Search,
    /// Lookup of a single item by id
    Lookup,
    /// Publishing a new item
    Post,
}

impl RequestCategory {
    /// All categories, in a stable order.
    pub const ALL: [RequestCategory; 3] = [
        RequestCategory::Search,
        RequestCategory::Lookup,
        RequestCategory::Post,
    ];

    /// Short lowercase name used in logs and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Search => "search",
            RequestCategory::Lookup => "lookup",
            RequestCategory::Post => "post",
        }
    }

    /// Provider-contract limit for this category.
    pub fn default_limit(&self) -> u32 {
        match self {
            RequestCategory::Search => SEARCH_LIMIT,
            RequestCategory::Lookup => LOOKUP_LIMIT,
            RequestCategory::Post => POST_LIMIT,
        }
    }

    /// Whether a successful request of this category counts as a read
    /// (as opposed to a post) against the monthly budget.
    pub fn is_read(&self) -> bool {
        !matches!(self, RequestCategory::Post)
    }
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(RequestCategory::Search),
            "lookup" => Ok(RequestCategory::Lookup),
            "post" => Ok(RequestCategory::Post),
            other => Err(format!(
                "unknown category '{}' (expected search, lookup or post)",
                other
            )),
        }
    }
}

/// Per-category limits sharing a single window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryLimits {
    pub search: u32,
    pub lookup: u32,
    pub post: u32,
    pub window_secs: u64,
}

impl CategoryLimits {
    /// Limit for one category.
    pub fn limit(&self, category: RequestCategory) -> u32 {
        match category {
            RequestCategory::Search => self.search,
            RequestCategory::Lookup => self.lookup,
            RequestCategory::Post => self.post,
        }
    }
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            search: RequestCategory::Search.default_limit(),
            lookup: RequestCategory::Lookup.default_limit(),
            post: RequestCategory::Post.default_limit(),
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = CategoryLimits::default();
        assert_eq!(limits.limit(RequestCategory::Search), 180);
        assert_eq!(limits.limit(RequestCategory::Lookup), 300);
        assert_eq!(limits.limit(RequestCategory::Post), 200);
        assert_eq!(limits.window_secs, 900);
    }

    #[test]
    fn test_parse_category() {
        assert_eq!("search".parse::<RequestCategory>(), Ok(RequestCategory::Search));
        assert_eq!(" Lookup ".parse::<RequestCategory>(), Ok(RequestCategory::Lookup));
        assert_eq!("POST".parse::<RequestCategory>(), Ok(RequestCategory::Post));
        assert!("timeline".parse::<RequestCategory>().is_err());
    }

    #[test]
    fn test_read_classification() {
        assert!(RequestCategory::Search.is_read());
        assert!(RequestCategory::Lookup.is_read());
        assert!(!RequestCategory::Post.is_read());
    }
}

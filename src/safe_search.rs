//! Safe-search enforcement: A/AAAA lookups for the big search engines are
//! answered with a CNAME to the provider's restricted endpoint.

use std::collections::HashMap;

/// Google properties share one enforcement host.
const GOOGLE_SAFE: &str = "forcesafesearch.google.com";
const BING_SAFE: &str = "strict.bing.com";

const GOOGLE_DOMAINS: &[&str] = &[
    "google.com",
    "www.google.com",
    "google.co.uk",
    "www.google.co.uk",
    "google.de",
    "www.google.de",
    "google.fr",
    "www.google.fr",
    "google.ca",
    "www.google.ca",
    "google.com.au",
    "www.google.com.au",
];

const BING_DOMAINS: &[&str] = &["bing.com", "www.bing.com"];

/// Immutable rewrite table, swapped on reload.
pub struct SafeSearch {
    enabled: bool,
    targets: HashMap<&'static str, &'static str>,
}

impl SafeSearch {
    pub fn new(enabled: bool) -> Self {
        let mut targets = HashMap::new();
        for domain in GOOGLE_DOMAINS {
            targets.insert(*domain, GOOGLE_SAFE);
        }
        for domain in BING_DOMAINS {
            targets.insert(*domain, BING_SAFE);
        }
        Self { enabled, targets }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// CNAME target for a normalized name, when enforcement applies.
    pub fn rewrite_target(&self, normalized_name: &str) -> Option<&'static str> {
        if !self.enabled {
            return None;
        }
        self.targets.get(normalized_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_known_engines() {
        let safe_search = SafeSearch::new(true);
        assert_eq!(
            safe_search.rewrite_target("www.google.com"),
            Some("forcesafesearch.google.com")
        );
        assert_eq!(
            safe_search.rewrite_target("bing.com"),
            Some("strict.bing.com")
        );
        assert_eq!(safe_search.rewrite_target("example.com"), None);
    }

    #[test]
    fn disabled_rewrites_nothing() {
        let safe_search = SafeSearch::disabled();
        assert_eq!(safe_search.rewrite_target("www.google.com"), None);
    }
}

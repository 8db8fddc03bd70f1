//! Reference-URL allowlist.
//!
//! A pattern permits a URL by exact match, by trailing-`*` prefix, or by
//! same-host comparison. An empty allowlist permits everything and is only
//! acceptable in development.

use url::Url;

#[derive(Debug, Clone, Default)]
pub struct RefAllowlist {
    patterns: Vec<String>,
}

impl RefAllowlist {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Empty allowlist = allow all.
    pub fn permits(&self, url: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns.iter().any(|p| pattern_matches(p, url))
    }
}

fn pattern_matches(pattern: &str, url: &str) -> bool {
    if pattern == url {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return url.starts_with(prefix);
    }
    // Same-host: both sides must parse and agree on scheme + host.
    match (Url::parse(pattern), Url::parse(url)) {
        (Ok(p), Ok(u)) => p.scheme() == u.scheme() && p.host_str() == u.host_str(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_permits_everything() {
        let a = RefAllowlist::default();
        assert!(a.permits("https://anything.example.com/schema.json"));
    }

    #[test]
    fn exact_match() {
        let a = RefAllowlist::new(vec!["https://forms.example.com/s.json".into()]);
        assert!(a.permits("https://forms.example.com/s.json"));
        assert!(!a.permits("https://forms.example.com/other.json"));
    }

    #[test]
    fn trailing_wildcard_prefix() {
        let a = RefAllowlist::new(vec!["https://forms.example.com/v1/*".into()]);
        assert!(a.permits("https://forms.example.com/v1/address.json"));
        assert!(a.permits("https://forms.example.com/v1/deep/nested.json"));
        assert!(!a.permits("https://forms.example.com/v2/address.json"));
    }

    #[test]
    fn same_host_comparison() {
        let a = RefAllowlist::new(vec!["https://forms.example.com".into()]);
        assert!(a.permits("https://forms.example.com/any/path.json"));
        assert!(!a.permits("https://evil.example.net/any/path.json"));
        // scheme must agree too
        assert!(!a.permits("http://forms.example.com/any/path.json"));
    }

    #[test]
    fn non_matching_url_is_rejected_when_list_nonempty() {
        let a = RefAllowlist::new(vec![
            "https://forms.example.com/*".into(),
            "https://schemas.example.org/base.json".into(),
        ]);
        assert!(!a.permits("https://other.example.io/s.json"));
    }
}

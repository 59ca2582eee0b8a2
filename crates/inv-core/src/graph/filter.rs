//! Name filters applied when hosts and groups are first referenced.

use regex::{Regex, RegexBuilder};

/// Compiled size limit for user supplied filter patterns.
const FILTER_SIZE_LIMIT: usize = 1 << 20;

/// A regular expression anchored at the start of the candidate name.
///
/// A name is accepted when the pattern matches a prefix of it, so `web`
/// accepts `web01` but not `staging-web01`. Use `.*web` to match anywhere.
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: String,
    regex: Regex,
}

impl NameFilter {
    /// Compiles a filter from a pattern string.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&format!("^(?:{})", pattern))
            .size_limit(FILTER_SIZE_LIMIT)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Returns the pattern as originally written.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns `true` if the name passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_anchored_at_start() {
        let filter = NameFilter::new("web").unwrap();
        assert!(filter.matches("web"));
        assert!(filter.matches("web01"));
        assert!(!filter.matches("staging-web01"));
    }

    #[test]
    fn test_filter_alternation_stays_anchored() {
        let filter = NameFilter::new("db|cache").unwrap();
        assert!(filter.matches("db1"));
        assert!(filter.matches("cache-a"));
        assert!(!filter.matches("mydb"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(NameFilter::new("web(").is_err());
    }

    #[test]
    fn test_pattern_round_trips() {
        let filter = NameFilter::new("^prod-.*$").unwrap();
        assert_eq!(filter.pattern(), "^prod-.*$");
        assert!(filter.matches("prod-east"));
    }
}

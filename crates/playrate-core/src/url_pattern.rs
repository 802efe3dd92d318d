//! Site-rule URL patterns.
//!
//! A pattern is literal text where `*` matches any run of characters. The
//! compiled regex is unanchored, so `example.com` matches anywhere in a URL.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::PatternError;
use crate::speed::Speed;
use crate::storage::SiteSettings;

/// Compile a wildcard pattern. Every character except `*` is literal.
pub fn compile(pattern: &str) -> Result<Regex, PatternError> {
    let source = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&source).map_err(|e| PatternError::Invalid {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// One-off match without caching. Invalid patterns never match.
#[must_use]
pub fn matches(pattern: &str, url: &str) -> bool {
    compile(pattern).is_ok_and(|re| re.is_match(url))
}

/// The rule that won for a URL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleMatch<'a> {
    pub pattern: &'a str,
    pub speed: Speed,
}

/// Compiled patterns keyed by pattern text. Failed compilations are cached
/// too, so a bad rule costs one compile per agent.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl PatternCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&mut self, pattern: &str, url: &str) -> bool {
        if !self.compiled.contains_key(pattern) {
            let compiled = match compile(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "Ignoring uncompilable site pattern");
                    None
                }
            };
            self.compiled.insert(pattern.to_string(), compiled);
        }
        self.compiled
            .get(pattern)
            .and_then(Option::as_ref)
            .is_some_and(|re| re.is_match(url))
    }

    /// First enabled rule, in insertion order, whose pattern matches `url`.
    ///
    /// Rules carrying an out-of-range speed are skipped.
    pub fn first_match<'a>(&mut self, rules: &'a SiteSettings, url: &str) -> Option<RuleMatch<'a>> {
        for (pattern, rule) in rules.iter() {
            if !rule.enabled || !self.matches(pattern, url) {
                continue;
            }
            match Speed::new(rule.speed) {
                Ok(speed) => {
                    debug!(pattern, speed = speed.get(), "Site rule matched");
                    return Some(RuleMatch { pattern, speed });
                }
                Err(e) => {
                    warn!(pattern, error = %e, "Skipping site rule with invalid speed");
                }
            }
        }
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn clear(&mut self) {
        self.compiled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SiteSpeedRule;

    #[test]
    fn wildcard_matches_any_run() {
        assert!(matches("*://example.com/*", "https://example.com/page"));
        assert!(matches("*://example.com/*", "http://example.com/"));
        assert!(!matches("*://example.com/*", "https://example.org/page"));
    }

    #[test]
    fn dots_are_literal() {
        assert!(!matches("example.com", "https://exampleXcom/"));
        assert!(matches("example.com", "https://www.example.com/watch"));
    }

    #[test]
    fn other_metacharacters_are_literal() {
        assert!(matches("site.com/a+b?(x)", "https://site.com/a+b?(x)"));
        assert!(!matches("site.com/a+b", "https://site.com/aab"));
        assert!(matches("[brackets]", "https://host/[brackets]"));
    }

    #[test]
    fn matching_is_unanchored() {
        assert!(matches("youtube", "https://www.youtube.com/watch?v=1"));
        assert!(matches("", "anything"));
    }

    #[test]
    fn cache_remembers_patterns() {
        let mut cache = PatternCache::new();
        assert!(cache.matches("a*c", "abc"));
        assert!(!cache.matches("a*c", "xyz"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn first_enabled_match_in_insertion_order_wins() {
        let mut rules = SiteSettings::default();
        rules.insert("*example.com*", SiteSpeedRule::new(1.5, false));
        rules.insert("*example.com/video*", SiteSpeedRule::new(2.0, true));
        rules.insert("*example.com*", SiteSpeedRule::new(1.5, false));
        rules.insert("*.com*", SiteSpeedRule::new(3.0, true));

        let mut cache = PatternCache::new();
        let hit = cache
            .first_match(&rules, "https://example.com/video/1")
            .unwrap();
        assert_eq!(hit.pattern, "*example.com/video*");
        assert_eq!(hit.speed.get(), 2.0);

        let hit = cache.first_match(&rules, "https://example.com/home").unwrap();
        assert_eq!(hit.pattern, "*.com*");
    }

    #[test]
    fn out_of_range_rules_are_skipped() {
        let mut rules = SiteSettings::default();
        rules.insert("*", SiteSpeedRule::new(40.0, true));
        rules.insert("*host*", SiteSpeedRule::new(1.25, true));

        let mut cache = PatternCache::new();
        let hit = cache.first_match(&rules, "https://host/").unwrap();
        assert_eq!(hit.speed.get(), 1.25);
    }
}

//! robots.txt consumption — loaded once at startup, read-only thereafter.
//!
//! Only the `Disallow:` rules under a `User-agent: *` block are kept; this
//! crate never fetches robots.txt itself (fetching is out of scope per
//! SPEC_FULL.md §1), it only parses a file already on disk.

use std::collections::HashSet;
use std::path::Path;

/// The set of `Disallow` path prefixes that apply to `User-agent: *`.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    disallowed: HashSet<String>,
}

impl RobotsRules {
    /// Load and parse a robots.txt file. A missing file yields an empty rule
    /// set (and the caller should log a warning), matching the upstream
    /// `load_robots_txt`'s `FileNotFoundError` handling.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(_) => Self::default(),
        }
    }

    /// Parse robots.txt text directly (used by tests and by `load`).
    pub fn parse(contents: &str) -> Self {
        let mut disallowed = HashSet::new();
        let mut in_wildcard_block = false;

        for raw_line in contents.lines() {
            let line = raw_line.trim().to_ascii_lowercase();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(ua) = line.strip_prefix("user-agent:") {
                in_wildcard_block = ua.trim() == "*";
            } else if in_wildcard_block {
                if let Some(rule) = line.strip_prefix("disallow:") {
                    let rule = rule.trim();
                    if !rule.is_empty() && rule != "/" {
                        disallowed.insert(rule.to_string());
                    }
                }
            }
        }

        Self { disallowed }
    }

    pub fn is_empty(&self) -> bool {
        self.disallowed.is_empty()
    }

    /// Whether `path` matches any `Disallow` prefix.
    pub fn is_disallowed(&self, path: &str) -> bool {
        if path.is_empty() || self.disallowed.is_empty() {
            return false;
        }
        self.disallowed.iter().any(|rule| path.starts_with(rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
User-agent: *
Disallow: /wp-admin
Disallow: /private/
Disallow: /

User-agent: Googlebot
Disallow: /no-google-only
";

    #[test]
    fn parses_wildcard_block_only() {
        let rules = RobotsRules::parse(SAMPLE);
        assert!(rules.is_disallowed("/wp-admin/install.php"));
        assert!(rules.is_disallowed("/private/secret"));
        assert!(!rules.is_disallowed("/no-google-only"));
    }

    #[test]
    fn bare_slash_disallow_is_ignored() {
        let rules = RobotsRules::parse(SAMPLE);
        assert!(!rules.is_disallowed("/anything-else"));
    }

    #[test]
    fn missing_file_yields_empty_rules() {
        let rules = RobotsRules::load("/nonexistent/path/robots.txt");
        assert!(rules.is_empty());
        assert!(!rules.is_disallowed("/wp-admin"));
    }

    #[test]
    fn empty_path_is_never_disallowed() {
        let rules = RobotsRules::parse(SAMPLE);
        assert!(!rules.is_disallowed(""));
    }
}

//! Suspicious-request pattern scanning.
//!
//! A small regex battery run over the request line, user agent, and
//! query string. These target probes and injection attempts that have
//! no business hitting a subscription endpoint.

use regex::{Regex, RegexBuilder};
use tracing::warn;

const BUILTIN_PATTERNS: &[&str] = &[
    r"eval\(",
    r"base64_decode\(",
    r"fromCharCode",
    r"admin.*login",
    r"etc/passwd",
    r"union.*select",
    r"<script",
    r"\.\./\.\.",
];

/// Compiled scanner over built-in plus configured patterns.
pub struct SuspectScanner {
    patterns: Vec<Regex>,
}

impl SuspectScanner {
    /// Compile the built-in battery plus `extra` user patterns.
    /// Invalid user patterns are logged and skipped.
    pub fn new(extra: &[String]) -> Self {
        let mut patterns = Vec::with_capacity(BUILTIN_PATTERNS.len() + extra.len());
        for source in BUILTIN_PATTERNS
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
        {
            match RegexBuilder::new(source).case_insensitive(true).build() {
                Ok(re) => patterns.push(re),
                Err(e) => warn!(pattern = %source, error = %e, "Skipping invalid suspect pattern"),
            }
        }
        Self { patterns }
    }

    /// First matching pattern in `corpus`, if any.
    pub fn scan(&self, corpus: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(corpus))
            .map(|re| re.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_builtin_probes() {
        let scanner = SuspectScanner::new(&[]);
        assert!(scanner.scan("GET /sub?x=eval(atob(p))").is_some());
        assert!(scanner.scan("curl /sub?f=../../etc/passwd").is_some());
        assert!(scanner.scan("1 UNION SELECT uuid FROM users").is_some());
        assert!(scanner.scan("Mozilla <ScRiPt>alert(1)</script>").is_some());
    }

    #[test]
    fn case_insensitive() {
        let scanner = SuspectScanner::new(&[]);
        assert!(scanner.scan("BASE64_DECODE(payload)").is_some());
    }

    #[test]
    fn clean_request_passes() {
        let scanner = SuspectScanner::new(&[]);
        assert!(scanner
            .scan("GET /sub?uuid=f1d2-aaaa&sid=1,2&target=clash Mozilla/5.0")
            .is_none());
    }

    #[test]
    fn extra_patterns_appended() {
        let scanner = SuspectScanner::new(&["badbot".to_string()]);
        assert!(scanner.scan("BadBot/1.0").is_some());
    }

    #[test]
    fn invalid_extra_pattern_skipped() {
        let scanner = SuspectScanner::new(&["([unclosed".to_string()]);
        assert!(scanner.scan("normal request").is_none());
    }
}

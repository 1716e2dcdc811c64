//! Suspicious request signatures.
//!
//! One compiled [`RegexSet`] shared by the admission gate (path and query)
//! and the threat monitor (log lines and recorded payloads).

use regex::{RegexSet, RegexSetBuilder};

/// Built-in signatures: SQL injection, XSS, command injection, path traversal.
pub fn default_patterns() -> Vec<String> {
    [
        // SQL injection
        r"union\s+(all\s+)?select",
        r"\b(or|and)\b\s+['\x22]?\w+['\x22]?\s*=\s*['\x22]?\w+",
        r"['\x22]\s*(or|and)\s+['\x22]",
        r";\s*(drop|delete|insert|update|alter|truncate)\s",
        r"\b(sleep|benchmark|pg_sleep)\s*\(",
        r"information_schema",
        r"'\s*--",
        // XSS
        r"<\s*script",
        r"javascript\s*:",
        r"\bon(error|load|click|mouseover|focus)\s*=",
        r"<\s*(iframe|object|embed|svg)",
        // Command injection
        r"(;|\||&&|`)\s*(cat|ls|rm|wget|curl|nc|bash|sh|python|perl)\b",
        r"\$\([^)]*\)",
        // Path traversal
        r"\.\./",
        r"\.\.\\",
        r"(?:%2e){2}(?:%2f|%5c)",
        r"/etc/(passwd|shadow)",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

pub struct PatternSet {
    set: RegexSet,
}

impl PatternSet {
    /// Compile case-insensitively. An invalid expression is a startup error.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = RegexSetBuilder::new(patterns).case_insensitive(true).build()?;
        Ok(Self { set })
    }

    pub fn is_suspicious(&self, text: &str) -> bool {
        !text.is_empty() && self.set.is_match(text)
    }

    /// Check a path and raw query, plus each percent-decoded query pair.
    pub fn is_suspicious_request(&self, path: &str, query: &str) -> bool {
        if self.is_suspicious(path) || self.is_suspicious(query) {
            return true;
        }
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(k, v)| self.is_suspicious(&k) || self.is_suspicious(&v))
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            set: RegexSetBuilder::new(default_patterns())
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> PatternSet {
        PatternSet::new(default_patterns()).unwrap()
    }

    #[test]
    fn test_detects_common_attacks() {
        let p = patterns();
        assert!(p.is_suspicious("id=1 UNION SELECT password FROM users"));
        assert!(p.is_suspicious("name=' or '1'='1"));
        assert!(p.is_suspicious("<script>alert(1)</script>"));
        assert!(p.is_suspicious("q=1; cat /etc/passwd"));
        assert!(p.is_suspicious("/static/../../etc/hosts"));
        assert!(p.is_suspicious("file=%2e%2e%2fconfig"));
    }

    #[test]
    fn test_ignores_ordinary_traffic() {
        let p = patterns();
        assert!(!p.is_suspicious("/api/products/reverse-osmosis-filter"));
        assert!(!p.is_suspicious("category=under-sink&sort=price&page=2"));
        assert!(!p.is_suspicious("q=water softener"));
        assert!(!p.is_suspicious(""));
    }

    #[test]
    fn test_decodes_query_pairs() {
        let p = patterns();
        assert!(p.is_suspicious_request("/search", "q=%3Cscript%3Ealert(1)%3C%2Fscript%3E"));
        assert!(p.is_suspicious_request("/search", "q=1+UNION+SELECT+1"));
        assert!(!p.is_suspicious_request("/search", "q=carbon+block"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(PatternSet::new(["(unclosed"]).is_err());
    }
}

//! Topic scope filtering.
//!
//! Decides which subscribed topics a retry configuration governs. Patterns
//! are written as `exact-name`, `glob:orders-*` or `regex:orders-\d+`; an
//! unprefixed pattern uses the filter's default syntax.

use glob::{MatchOptions, Pattern};
use regex::{Regex, RegexBuilder};

use crate::retrytopic::ConfigurationError;

/// How an unprefixed pattern is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSyntax {
    #[default]
    Exact,
    Glob,
    Regex,
}

/// A compiled topic pattern.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    Exact { name: String, case_sensitive: bool },
    Glob { pattern: Pattern, case_sensitive: bool },
    /// Anchored: must match the whole topic name.
    Regex(Regex),
}

impl TopicPattern {
    /// Compile `raw`, honoring a `glob:` / `regex:` / `exact:` prefix.
    pub fn parse(
        raw: &str,
        default_syntax: PatternSyntax,
        case_sensitive: bool,
    ) -> Result<Self, ConfigurationError> {
        let (syntax, body) = if let Some(rest) = raw.strip_prefix("glob:") {
            (PatternSyntax::Glob, rest)
        } else if let Some(rest) = raw.strip_prefix("regex:") {
            (PatternSyntax::Regex, rest)
        } else if let Some(rest) = raw.strip_prefix("exact:") {
            (PatternSyntax::Exact, rest)
        } else {
            (default_syntax, raw)
        };

        let invalid = |reason: String| ConfigurationError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };

        match syntax {
            PatternSyntax::Exact => Ok(Self::Exact {
                name: body.to_string(),
                case_sensitive,
            }),
            PatternSyntax::Glob => Pattern::new(body)
                .map(|pattern| Self::Glob {
                    pattern,
                    case_sensitive,
                })
                .map_err(|e| invalid(e.to_string())),
            PatternSyntax::Regex => RegexBuilder::new(&format!("^(?:{})$", body))
                .case_insensitive(!case_sensitive)
                .build()
                .map(Self::Regex)
                .map_err(|e| invalid(e.to_string())),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact {
                name,
                case_sensitive: true,
            } => name == topic,
            Self::Exact {
                name,
                case_sensitive: false,
            } => name.eq_ignore_ascii_case(topic),
            Self::Glob {
                pattern,
                case_sensitive,
            } => pattern.matches_with(
                topic,
                MatchOptions {
                    case_sensitive: *case_sensitive,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            ),
            Self::Regex(regex) => regex.is_match(topic),
        }
    }
}

/// Allow/deny filter over topic names.
///
/// A topic passes when it matches some allow pattern (or the allow list is
/// empty) and matches no deny pattern.
#[derive(Debug, Clone, Default)]
pub struct TopicScopeFilter {
    allow: Vec<TopicPattern>,
    deny: Vec<TopicPattern>,
}

impl TopicScopeFilter {
    /// Filter that admits every topic.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(allow: Vec<TopicPattern>, deny: Vec<TopicPattern>) -> Self {
        Self { allow, deny }
    }

    /// Compile allow and deny pattern strings.
    pub fn from_patterns<A, D>(
        allow: A,
        deny: D,
        default_syntax: PatternSyntax,
        case_sensitive: bool,
    ) -> Result<Self, ConfigurationError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let compile = |raw: &str| TopicPattern::parse(raw, default_syntax, case_sensitive);
        Ok(Self {
            allow: allow
                .into_iter()
                .map(|p| compile(p.as_ref()))
                .collect::<Result<_, _>>()?,
            deny: deny
                .into_iter()
                .map(|p| compile(p.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn is_allowed(&self, topic: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|p| p.matches(topic));
        allowed && !self.deny.iter().any(|p| p.matches(topic))
    }

    /// Whether every topic in `topics` passes the filter.
    pub fn applies<S: AsRef<str>>(&self, topics: &[S]) -> bool {
        topics.iter().all(|t| self.is_allowed(t.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow: &[&str], deny: &[&str]) -> TopicScopeFilter {
        TopicScopeFilter::from_patterns(allow, deny, PatternSyntax::Exact, true).unwrap()
    }

    #[test]
    fn test_empty_filter_allows_all() {
        assert!(TopicScopeFilter::all().applies(&["orders", "payments"]));
    }

    #[test]
    fn test_allow_list() {
        let f = filter(&["orders"], &[]);
        assert!(f.applies(&["orders"]));
        assert!(!f.applies(&["payments"]));
    }

    #[test]
    fn test_deny_list() {
        let f = filter(&[], &["audit"]);
        assert!(f.applies(&["orders"]));
        assert!(!f.applies(&["audit"]));
    }

    #[test]
    fn test_every_topic_must_pass() {
        let f = filter(&["orders", "payments"], &[]);
        assert!(f.applies(&["orders", "payments"]));
        assert!(!f.applies(&["orders", "audit"]));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let f = filter(&["glob:orders*"], &["orders-internal"]);
        assert!(f.applies(&["orders-eu"]));
        assert!(!f.applies(&["orders-internal"]));
    }

    #[test]
    fn test_glob_pattern() {
        let f = filter(&["glob:orders-*"], &[]);
        assert!(f.is_allowed("orders-eu"));
        assert!(!f.is_allowed("payments-eu"));
    }

    #[test]
    fn test_regex_is_anchored() {
        let f = filter(&[r"regex:orders-\d+"], &[]);
        assert!(f.is_allowed("orders-42"));
        assert!(!f.is_allowed("orders-42-retry-0"));
        assert!(!f.is_allowed("my-orders-42"));
    }

    #[test]
    fn test_case_insensitive() {
        let f = TopicScopeFilter::from_patterns(
            ["Orders", "glob:PAY*", "regex:AUDIT-.*"],
            Vec::<String>::new(),
            PatternSyntax::Exact,
            false,
        )
        .unwrap();

        assert!(f.is_allowed("orders"));
        assert!(f.is_allowed("payments"));
        assert!(f.is_allowed("audit-log"));
    }

    #[test]
    fn test_default_syntax_applies_to_unprefixed() {
        let f = TopicScopeFilter::from_patterns(["orders-*"], Vec::<String>::new(), PatternSyntax::Glob, true)
            .unwrap();
        assert!(f.is_allowed("orders-us"));
    }

    #[test]
    fn test_invalid_regex_reported() {
        let err = TopicPattern::parse("regex:(", PatternSyntax::Exact, true).unwrap_err();
        match err {
            ConfigurationError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "regex:("),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

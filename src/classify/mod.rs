//! Failure classification.
//!
//! Decides whether a failure is retried, sent straight to a dead-letter
//! destination, or left unconfigured (treated as retryable).
//!
//! ## Precedence
//!
//! At each level of the cause chain (only the outermost failure unless
//! `traverse_causes` is set):
//! 1. a kind on the process-wide fatal list is `Fatal`
//! 2. a kind on the exclude list is `Fatal`
//! 3. a kind on the include list is `Retry`
//!
//! If nothing matched, a non-empty include list makes the failure `Fatal`
//! (only listed kinds retry); otherwise it is `NotConfigured`.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::failure::{kinds, ListenerFailure};

/// Classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Retry through the next chain stage.
    Retry,
    /// Skip remaining retries; go to a dead-letter destination.
    Fatal,
    /// No rule matched; retried by default.
    NotConfigured,
}

impl Classification {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Process-wide list of failure kinds that are never retried.
///
/// Built once at startup and injected into every classifier. Overrides go
/// through [`FatalKinds::with`] / [`FatalKinds::without`] before the list is
/// shared, never through mutation afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalKinds {
    kinds: BTreeSet<String>,
}

impl Default for FatalKinds {
    fn default() -> Self {
        let kinds = [
            kinds::DESERIALIZATION,
            kinds::MESSAGE_CONVERSION,
            kinds::CONVERSION,
            kinds::METHOD_ARGUMENT_RESOLUTION,
            kinds::NO_SUCH_METHOD,
            kinds::CLASS_CAST,
            kinds::MISSING_RETRY_HEADERS,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self { kinds }
    }
}

impl FatalKinds {
    /// An empty list: nothing is fatal unless configured.
    pub fn empty() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    /// Add a kind to the list.
    pub fn with(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into());
        self
    }

    /// Remove a kind from the list.
    pub fn without(mut self, kind: &str) -> Self {
        self.kinds.remove(kind);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().map(String::as_str)
    }
}

/// Include/exclude classifier for one retry configuration.
#[derive(Debug, Clone)]
pub struct ExceptionClassifier {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
    traverse_causes: bool,
    fatal: Arc<FatalKinds>,
}

impl Default for ExceptionClassifier {
    fn default() -> Self {
        Self::new(Arc::new(FatalKinds::default()))
    }
}

impl ExceptionClassifier {
    /// Include-all classifier backed by the given fatal list.
    pub fn new(fatal: Arc<FatalKinds>) -> Self {
        Self {
            include: BTreeSet::new(),
            exclude: BTreeSet::new(),
            traverse_causes: false,
            fatal,
        }
    }

    /// Only these kinds are retried.
    pub fn with_include<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(kinds.into_iter().map(Into::into));
        self
    }

    /// These kinds are never retried.
    pub fn with_exclude<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_traverse_causes(mut self, traverse: bool) -> Self {
        self.traverse_causes = traverse;
        self
    }

    pub fn traverse_causes(&self) -> bool {
        self.traverse_causes
    }

    pub fn include(&self) -> &BTreeSet<String> {
        &self.include
    }

    pub fn exclude(&self) -> &BTreeSet<String> {
        &self.exclude
    }

    pub fn fatal_kinds(&self) -> &FatalKinds {
        &self.fatal
    }

    /// Classify using the configured `traverse_causes` flag.
    pub fn classify(&self, failure: &ListenerFailure) -> Classification {
        self.classify_with(failure, self.traverse_causes)
    }

    /// Classify, walking the cause chain only if `traverse_causes` is set.
    pub fn classify_with(&self, failure: &ListenerFailure, traverse_causes: bool) -> Classification {
        let depth = if traverse_causes { usize::MAX } else { 1 };

        for level in failure.chain().take(depth) {
            let kind = level.kind();
            if self.fatal.contains(kind) || self.exclude.contains(kind) {
                return Classification::Fatal;
            }
            if self.include.contains(kind) {
                return Classification::Retry;
            }
        }

        if self.include.is_empty() {
            Classification::NotConfigured
        } else {
            Classification::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: &str) -> ListenerFailure {
        ListenerFailure::new(kind, "boom")
    }

    #[test]
    fn test_default_retries_everything_not_fatal() {
        let classifier = ExceptionClassifier::default();
        assert_eq!(
            classifier.classify(&failure("TimeoutError")),
            Classification::NotConfigured
        );
        assert!(classifier.classify(&failure("TimeoutError")).is_retryable());
    }

    #[test]
    fn test_default_fatal_kinds() {
        let classifier = ExceptionClassifier::default();
        for kind in [
            kinds::DESERIALIZATION,
            kinds::MESSAGE_CONVERSION,
            kinds::CLASS_CAST,
            kinds::MISSING_RETRY_HEADERS,
        ] {
            assert_eq!(classifier.classify(&failure(kind)), Classification::Fatal);
        }
    }

    #[test]
    fn test_fatal_override() {
        let fatal = FatalKinds::default()
            .with("PoisonPill")
            .without(kinds::CLASS_CAST);
        let classifier = ExceptionClassifier::new(Arc::new(fatal));

        assert_eq!(classifier.classify(&failure("PoisonPill")), Classification::Fatal);
        assert_eq!(
            classifier.classify(&failure(kinds::CLASS_CAST)),
            Classification::NotConfigured
        );
    }

    #[test]
    fn test_include_list_restricts_retries() {
        let classifier = ExceptionClassifier::default().with_include(["TimeoutError"]);

        assert_eq!(classifier.classify(&failure("TimeoutError")), Classification::Retry);
        assert_eq!(classifier.classify(&failure("ValidationError")), Classification::Fatal);
    }

    #[test]
    fn test_exclude_list() {
        let classifier = ExceptionClassifier::default().with_exclude(["ValidationError"]);

        assert_eq!(classifier.classify(&failure("ValidationError")), Classification::Fatal);
        assert_eq!(
            classifier.classify(&failure("TimeoutError")),
            Classification::NotConfigured
        );
    }

    #[test]
    fn test_fatal_list_beats_include() {
        let classifier = ExceptionClassifier::default().with_include([kinds::DESERIALIZATION]);
        assert_eq!(
            classifier.classify(&failure(kinds::DESERIALIZATION)),
            Classification::Fatal
        );
    }

    #[test]
    fn test_traverse_causes() {
        let wrapped = ListenerFailure::new("ListenerExecutionFailed", "wrapped")
            .caused_by(failure("ValidationError"));
        let classifier = ExceptionClassifier::default().with_exclude(["ValidationError"]);

        assert_eq!(classifier.classify(&wrapped), Classification::NotConfigured);
        assert_eq!(classifier.classify_with(&wrapped, true), Classification::Fatal);

        let traversing = classifier.with_traverse_causes(true);
        assert_eq!(traversing.classify(&wrapped), Classification::Fatal);
    }

    #[test]
    fn test_traverse_causes_finds_fatal_in_chain() {
        let wrapped = ListenerFailure::new("ListenerExecutionFailed", "wrapped")
            .caused_by(failure(kinds::DESERIALIZATION));
        let classifier = ExceptionClassifier::default().with_traverse_causes(true);
        assert_eq!(classifier.classify(&wrapped), Classification::Fatal);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let classifier = ExceptionClassifier::default().with_include(["A", "B"]);
        let f = failure("B");
        assert_eq!(classifier.classify(&f), classifier.classify(&f));
    }
}

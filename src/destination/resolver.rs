//! Next-destination resolution at failure time.

use std::sync::Arc;

use crate::classify::{Classification, ExceptionClassifier};
use crate::failure::ListenerFailure;

use super::{DestinationChain, DestinationProperties, DestinationType};

/// Why a record left the retry stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The failure was classified fatal.
    Fatal,
    /// The attempt budget is used up.
    AttemptsExhausted,
    /// The global timeout elapsed since the first attempt.
    TimeoutExpired,
    /// The record arrived on a retry stage without its retry headers.
    MissingRetryHeaders,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Fatal => "fatal failure",
            Self::AttemptsExhausted => "attempts exhausted",
            Self::TimeoutExpired => "timeout expired",
            Self::MissingRetryHeaders => "missing retry headers",
        };
        f.write_str(text)
    }
}

/// Where a failed record goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Republish to this retry stage.
    Retry(&'a DestinationProperties),
    /// Dead-letter the record at this stage.
    DeadLetter {
        destination: &'a DestinationProperties,
        reason: TerminalReason,
    },
    /// Terminal, but the chain has no DLT: log and acknowledge.
    Discard { reason: TerminalReason },
}

impl Route<'_> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retry(_))
    }
}

/// Resolves the next chain stage for a failed record.
///
/// Pure: the same inputs always produce the same route. The current time is
/// passed in rather than read.
#[derive(Debug, Clone)]
pub struct DestinationResolver {
    chain: Arc<DestinationChain>,
    classifier: ExceptionClassifier,
    timeout_ms: Option<u64>,
}

impl DestinationResolver {
    pub fn new(
        chain: Arc<DestinationChain>,
        classifier: ExceptionClassifier,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            chain,
            classifier,
            timeout_ms,
        }
    }

    pub fn chain(&self) -> &DestinationChain {
        &self.chain
    }

    pub fn classifier(&self) -> &ExceptionClassifier {
        &self.classifier
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Resolve where a record that failed on `current` goes next.
    ///
    /// `attempts` counts every attempt so far, including the one that just
    /// failed. `first_attempt_ms` and `now_ms` are epoch milliseconds.
    pub fn resolve_next(
        &self,
        current: &DestinationProperties,
        attempts: u32,
        first_attempt_ms: i64,
        failure: &ListenerFailure,
        now_ms: i64,
    ) -> Route<'_> {
        if self.timed_out(first_attempt_ms, now_ms)
            || current.destination_type == DestinationType::RetryWithTimeoutExpired
        {
            return self.default_dead_letter(TerminalReason::TimeoutExpired);
        }

        if self.classifier.classify(failure) == Classification::Fatal {
            return self.dead_letter_for(failure, TerminalReason::Fatal);
        }

        if current.is_dead_letter() {
            return self.dead_letter_for(failure, TerminalReason::AttemptsExhausted);
        }

        if attempts < current.max_attempts {
            let next = if current.destination_type == DestinationType::ReusableRetry {
                self.chain.get_by_suffix(&current.suffix)
            } else {
                self.chain
                    .index_of(&current.suffix)
                    .and_then(|index| self.chain.next_retry_after(index))
            };
            if let Some(next) = next {
                return Route::Retry(next);
            }
        }

        self.dead_letter_for(failure, TerminalReason::AttemptsExhausted)
    }

    /// Dead-letter route for a terminal failure, honoring routing rules.
    pub fn dead_letter_for(&self, failure: &ListenerFailure, reason: TerminalReason) -> Route<'_> {
        let main = self.chain.main();
        let routed = main
            .dlt_routing
            .suffix_for(failure, self.classifier.traverse_causes())
            .and_then(|suffix| self.chain.rerouting_dlt(suffix));

        match routed {
            Some(destination) => Route::DeadLetter {
                destination,
                reason,
            },
            None => self.default_dead_letter(reason),
        }
    }

    fn default_dead_letter(&self, reason: TerminalReason) -> Route<'_> {
        match self.chain.default_dlt() {
            Some(destination) => Route::DeadLetter {
                destination,
                reason,
            },
            None => Route::Discard { reason },
        }
    }

    fn timed_out(&self, first_attempt_ms: i64, now_ms: i64) -> bool {
        match self.timeout_ms {
            Some(timeout) => {
                now_ms.saturating_sub(first_attempt_ms) > i64::try_from(timeout).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }
}

//! Backoff policies: attempt index to delay.
//!
//! A policy is a pure description; [`BackoffExecution`] is the cursor that
//! walks it. Chains sample each retry stage's delay once, at build time, so
//! randomized policies are jittered per stage rather than per record.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

/// Default delay for fixed backoff (ms).
pub const DEFAULT_DELAY_MS: u64 = 1000;
/// Default cap for exponential backoff (ms).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default multiplier for exponential backoff.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Outcome of asking a backoff for its next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDelay {
    /// Wait this many milliseconds before the next attempt.
    Millis(u64),
    /// No further attempts; the caller routes to the dead-letter destination.
    Stop,
}

impl BackoffDelay {
    pub fn millis(self) -> Option<u64> {
        match self {
            Self::Millis(ms) => Some(ms),
            Self::Stop => None,
        }
    }
}

/// User-supplied delay function: 1-based attempt index to delay.
pub type CustomBackoff = Arc<dyn Fn(u32) -> BackoffDelay + Send + Sync>;

/// Delay strategy between successive attempts.
#[derive(Clone)]
pub enum BackoffPolicy {
    /// Always zero delay.
    None,
    /// Constant delay.
    Fixed { interval_ms: u64 },
    /// `initial * multiplier^(attempt-1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
    /// Exponential value jittered uniformly into `[d, d * (1 + jitter)]`, capped at `max_ms`.
    ExponentialRandom {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
        jitter: f64,
    },
    /// Uniformly random delay in `[min_ms, max_ms]`.
    UniformRandom { min_ms: u64, max_ms: u64 },
    /// Arbitrary user function.
    Custom(CustomBackoff),
}

impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Fixed { interval_ms } => f
                .debug_struct("Fixed")
                .field("interval_ms", interval_ms)
                .finish(),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => f
                .debug_struct("Exponential")
                .field("initial_ms", initial_ms)
                .field("multiplier", multiplier)
                .field("max_ms", max_ms)
                .finish(),
            Self::ExponentialRandom {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            } => f
                .debug_struct("ExponentialRandom")
                .field("initial_ms", initial_ms)
                .field("multiplier", multiplier)
                .field("max_ms", max_ms)
                .field("jitter", jitter)
                .finish(),
            Self::UniformRandom { min_ms, max_ms } => f
                .debug_struct("UniformRandom")
                .field("min_ms", min_ms)
                .field("max_ms", max_ms)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed {
            interval_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(interval_ms: u64) -> Self {
        Self::Fixed { interval_ms }
    }

    /// Exponential backoff with the default 30s cap.
    pub fn exponential(initial_ms: u64, multiplier: f64) -> Self {
        Self::Exponential {
            initial_ms,
            multiplier,
            max_ms: DEFAULT_MAX_DELAY_MS,
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> BackoffDelay + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Delay before attempt `attempt_index + 1`, given `attempt_index` attempts
    /// have failed (1-based).
    pub fn delay_for(&self, attempt_index: u32) -> BackoffDelay {
        let attempt_index = attempt_index.max(1);
        match self {
            Self::None => BackoffDelay::Millis(0),
            Self::Fixed { interval_ms } => BackoffDelay::Millis(*interval_ms),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => BackoffDelay::Millis(exponential_ms(
                *initial_ms,
                *multiplier,
                *max_ms,
                attempt_index,
            )),
            Self::ExponentialRandom {
                initial_ms,
                multiplier,
                max_ms,
                jitter,
            } => {
                let base = exponential_ms(*initial_ms, *multiplier, *max_ms, attempt_index);
                let upper = ((base as f64) * (1.0 + jitter.max(0.0))).min(*max_ms as f64) as u64;
                BackoffDelay::Millis(random_between(base, upper.max(base)))
            }
            Self::UniformRandom { min_ms, max_ms } => {
                BackoffDelay::Millis(random_between(*min_ms, (*max_ms).max(*min_ms)))
            }
            Self::Custom(f) => f(attempt_index),
        }
    }

    /// Whether every delay this policy yields is the same value.
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::None | Self::Fixed { .. })
    }

    /// Start a cursor that yields at most `max_retries` delays, then `Stop`.
    pub fn start(&self, max_retries: u32) -> BackoffExecution {
        BackoffExecution {
            policy: self.clone(),
            max_retries,
            attempt: 0,
        }
    }
}

fn exponential_ms(initial_ms: u64, multiplier: f64, max_ms: u64, attempt_index: u32) -> u64 {
    let exponent = i32::try_from(attempt_index - 1).unwrap_or(i32::MAX);
    let raw = (initial_ms as f64) * multiplier.powi(exponent);
    if raw.is_finite() {
        raw.min(max_ms as f64) as u64
    } else {
        max_ms
    }
}

fn random_between(lo: u64, hi: u64) -> u64 {
    if lo >= hi {
        return lo;
    }
    rand::rng().random_range(lo..=hi)
}

/// Cursor over a [`BackoffPolicy`].
///
/// Owned by whoever is backing off; there is no ambient per-thread state.
#[derive(Debug, Clone)]
pub struct BackoffExecution {
    policy: BackoffPolicy,
    max_retries: u32,
    attempt: u32,
}

impl BackoffExecution {
    /// Next delay, or `Stop` once `max_retries` delays have been produced or
    /// the policy itself stops.
    pub fn next_delay(&mut self) -> BackoffDelay {
        if self.attempt >= self.max_retries {
            return BackoffDelay::Stop;
        }
        self.attempt += 1;
        self.policy.delay_for(self.attempt)
    }

    /// Number of delays produced so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Backoff for unrecoverable failures: once the execution stops, keep
/// repeating the last interval instead of giving up.
#[derive(Debug, Clone)]
pub struct RepeatingBackoff {
    policy: BackoffPolicy,
    max_retries: u32,
    execution: Option<BackoffExecution>,
    last_interval_ms: u64,
}

impl RepeatingBackoff {
    pub fn new(policy: BackoffPolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
            execution: None,
            last_interval_ms: 0,
        }
    }

    /// Interval to wait before the next redelivery.
    pub fn next_interval_ms(&mut self) -> u64 {
        let execution = self
            .execution
            .get_or_insert_with(|| self.policy.start(self.max_retries));
        if let BackoffDelay::Millis(ms) = execution.next_delay() {
            self.last_interval_ms = ms;
        }
        self.last_interval_ms
    }

    /// Forget progress after a success.
    pub fn reset(&mut self) {
        self.execution = None;
        self.last_interval_ms = 0;
    }
}

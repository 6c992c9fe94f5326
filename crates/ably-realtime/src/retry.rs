//! Retry delays shared by the connection and channel state machines.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use uuid::Uuid;

/// Computes how long to wait before retry number `n` (1-based).
pub trait RetryDelayCalculator: Send + Sync {
    fn delay(&self, retry_number: u32) -> Duration;
}

/// Returns a jitter coefficient; the default draws uniformly from `[0.8, 1.0)`.
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Incremental backoff: `initial × min((n + 2) / 3, 2) × jitter`, clamped to `max`.
///
/// The first retry waits about `initial`, the coefficient then grows by a
/// third per attempt until it caps at twice the initial timeout.
#[derive(Clone)]
pub struct BackoffRetryDelayCalculator {
    initial: Duration,
    max: Duration,
    jitter: JitterSource,
}

impl BackoffRetryDelayCalculator {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: Arc::new(|| rand::rng().random_range(0.8..1.0)),
        }
    }

    /// Replace the random jitter, e.g. with `|| 1.0` for deterministic tests.
    pub fn with_jitter(mut self, jitter: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }
}

impl fmt::Debug for BackoffRetryDelayCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffRetryDelayCalculator")
            .field("initial", &self.initial)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl RetryDelayCalculator for BackoffRetryDelayCalculator {
    fn delay(&self, retry_number: u32) -> Duration {
        let n = f64::from(retry_number.max(1));
        let backoff = ((n + 2.0) / 3.0).min(2.0);
        let jitter = (self.jitter)().clamp(0.0, 1.0);
        self.initial.mul_f64(backoff * jitter).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub delay: Duration,
}

/// Counts consecutive retries; discarded as a whole rather than reset.
pub(crate) struct RetrySequence {
    id: Uuid,
    attempts: u32,
    calculator: Arc<dyn RetryDelayCalculator>,
}

impl RetrySequence {
    fn new(calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempts: 0,
            calculator,
        }
    }

    fn add_retry_attempt(&mut self) -> RetryAttempt {
        self.attempts = self.attempts.saturating_add(1);
        let attempt = RetryAttempt {
            id: Uuid::new_v4(),
            delay: self.calculator.delay(self.attempts),
        };
        tracing::debug!(
            sequence = %self.id,
            attempt = self.attempts,
            delay_ms = attempt.delay.as_millis() as u64,
            "Retry attempt scheduled",
        );
        attempt
    }
}

/// Owns the retry sequence of one state machine. The sequence is replaced
/// with a fresh one as soon as a transition leaves the retry-eligible states.
pub(crate) struct RetryState<S> {
    calculator: Arc<dyn RetryDelayCalculator>,
    sequence: Option<RetrySequence>,
    eligible: fn(S) -> bool,
}

impl<S: Copy + fmt::Debug> RetryState<S> {
    pub(crate) fn new(calculator: Arc<dyn RetryDelayCalculator>, eligible: fn(S) -> bool) -> Self {
        Self {
            calculator,
            sequence: None,
            eligible,
        }
    }

    pub(crate) fn add_retry_attempt(&mut self) -> RetryAttempt {
        let calculator = &self.calculator;
        self.sequence
            .get_or_insert_with(|| RetrySequence::new(Arc::clone(calculator)))
            .add_retry_attempt()
    }

    pub(crate) fn on_transition(&mut self, current: S) {
        if !(self.eligible)(current)
            && let Some(sequence) = self.sequence.take()
        {
            tracing::trace!(
                sequence = %sequence.id,
                state = ?current,
                "Left retry-eligible states, discarding retry sequence",
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self) -> u32 {
        self.sequence.as_ref().map_or(0, |s| s.attempts)
    }
}

//! Backoff: attempt → delay, the pure core that every retry path shares.
//!
//! `next_for_attempt` is a pure function and safe to call concurrently.
//! `next` advances an internal attempt counter and is meant to be owned by a
//! single caller at a time (the register worker's shared backoff is driven
//! from one state-machine loop, never raced).

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Coarse failure cause used to pick a backoff ceiling independent of the
/// configured max (§4.A `maxByCause`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    InvalidLicense,
    TrialExpired,
    TrialInactive,
    ServiceError,
    Other,
}

impl Cause {
    /// Ceiling this cause imposes, or `None` to fall back to the backoff's
    /// own configured max.
    pub fn max_override(self) -> Option<Duration> {
        match self {
            Cause::InvalidLicense | Cause::TrialExpired => Some(Duration::from_secs(60 * 60)),
            Cause::TrialInactive | Cause::ServiceError => Some(Duration::from_secs(5 * 60)),
            Cause::Other => None,
        }
    }
}

/// Duration large enough to stand in for "unbounded" without risking
/// overflow in the exponent math below.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// `delay = min * factor^attempt`, clamped to `[min, max]`, with optional
/// full jitter sampled uniformly from `[min, delay]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: std::sync::Arc<AtomicU64>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self { min, max: max.max(min), factor: factor.max(1.0), jitter, attempt: Default::default() }
    }

    /// Convenience constructor matching common agent defaults: 1s..60s, x2 factor, jittered.
    pub fn default_agent() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, true)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Pure: compute the delay for a given zero-indexed attempt. Safe to call
    /// concurrently; does not touch the internal attempt counter.
    pub fn next_for_attempt(&self, attempt: u64) -> Duration {
        self.next_for_attempt_bounded(attempt, self.max)
    }

    /// Like [`Self::next_for_attempt`] but clamps to `min(self.max, max_override)`
    /// when `max_override` is non-zero.
    pub fn next_for_attempt_bounded(&self, attempt: u64, max_override: Duration) -> Duration {
        let cap = if max_override > Duration::ZERO { self.max.min(max_override) } else { self.max };

        let scaled = self.factor.powi(attempt.min(u32::MAX as u64) as i32);
        let delay_secs = self.min.as_secs_f64() * scaled;

        let unclamped = if !delay_secs.is_finite() || delay_secs > cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(delay_secs)
        };
        let clamped = unclamped.clamp(self.min, cap);

        if self.jitter {
            Self::sample_uniform(self.min, clamped)
        } else {
            clamped
        }
    }

    fn sample_uniform(min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let jittered = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(jittered)
    }

    /// Advance the attempt counter and return the delay for the attempt just
    /// consumed. Not safe to race: the caller must serialize access (the
    /// register worker and connect service each own one instance per
    /// in-flight retry sequence).
    pub fn next(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        self.next_for_attempt(attempt)
    }

    /// Like [`Self::next`] but respects a per-call max override (e.g. a
    /// server-provided `MaxBackOff`).
    pub fn next_bounded(&self, max_override: Duration) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        self.next_for_attempt_bounded(attempt, max_override)
    }

    /// Reset the attempt counter to zero.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Current attempt count (for telemetry/tests).
    pub fn attempt_count(&self) -> u64 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Ceiling to use for a given failure cause, falling back to `self.max`.
    pub fn max_for_cause(&self, cause: Cause) -> Duration {
        cause.max_override().unwrap_or(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_non_decreasing_until_saturation() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0, false);
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let d = b.next_for_attempt(attempt);
            assert!(d >= prev || d == b.max());
            assert!(d >= b.min() && d <= b.max());
            prev = d;
        }
        assert_eq!(b.next_for_attempt(19), b.max());
    }

    #[test]
    fn jitter_stays_within_min_and_unjittered_delay() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, true);
        for attempt in 0..10 {
            let unjittered = Backoff::new(b.min(), b.max(), 2.0, false).next_for_attempt(attempt);
            for _ in 0..20 {
                let d = b.next_for_attempt(attempt);
                assert!(d >= b.min());
                assert!(d <= unjittered);
            }
        }
    }

    #[test]
    fn next_for_attempt_is_pure() {
        let b = Backoff::new(Duration::from_millis(50), Duration::from_secs(1), 2.0, false);
        assert_eq!(b.next_for_attempt(3), b.next_for_attempt(3));
        assert_eq!(b.attempt_count(), 0);
    }

    #[test]
    fn next_advances_attempt_and_is_stateful() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, false);
        let d0 = b.next();
        let d1 = b.next();
        assert_eq!(b.attempt_count(), 2);
        assert!(d1 >= d0);
    }

    #[test]
    fn reset_returns_attempt_to_zero() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, false);
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.attempt_count(), 0);
        assert_eq!(b.next_for_attempt(0), b.next());
    }

    #[test]
    fn next_bounded_uses_smaller_of_max_and_override() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 2.0, false);
        let d = b.next_for_attempt_bounded(10, Duration::from_secs(5));
        assert_eq!(d, Duration::from_secs(5));

        // Zero override means "use configured max".
        let d2 = b.next_for_attempt_bounded(10, Duration::ZERO);
        assert_eq!(d2, b.max());
    }

    #[test]
    fn overflow_saturates_to_max() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, false);
        let d = b.next_for_attempt(1_000);
        assert_eq!(d, b.max());
    }

    #[test]
    fn max_by_cause_maps_known_causes() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0, false);
        assert_eq!(b.max_for_cause(Cause::InvalidLicense), Duration::from_secs(3600));
        assert_eq!(b.max_for_cause(Cause::TrialExpired), Duration::from_secs(3600));
        assert_eq!(b.max_for_cause(Cause::TrialInactive), Duration::from_secs(300));
        assert_eq!(b.max_for_cause(Cause::ServiceError), Duration::from_secs(300));
        assert_eq!(b.max_for_cause(Cause::Other), b.max());
    }

    #[test]
    fn constant_backoff_when_factor_is_one() {
        let b = Backoff::new(Duration::from_secs(2), Duration::from_secs(30), 1.0, false);
        assert_eq!(b.next_for_attempt(0), Duration::from_secs(2));
        assert_eq!(b.next_for_attempt(5), Duration::from_secs(2));
    }
}

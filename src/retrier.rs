//! Retrier: wraps [`Backoff`] with cancellable sleeps and a "fixed next
//! delay" override that bypasses the exponential schedule (e.g. a server's
//! `Retry-After` header).

use crate::backoff::Backoff;
use crate::sleeper::{sleep_cancellable, Sleeper, TokioSleeper};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// No schedule set yet; `remaining()` reports ready.
    None,
    /// `scheduleAfter(d)`: next wakeup is exactly `d` from when it was set,
    /// ignoring the exponential schedule entirely.
    Fixed { scheduled_at: Instant, delay: Duration },
    /// `scheduleWithBackoff()`: next wakeup uses the delay Backoff produced.
    Exponential { scheduled_at: Instant, delay: Duration },
}

/// Drives the cancellable-sleep half of retry: given a [`Backoff`], decide
/// when the next attempt is due and sleep until then (or until cancelled).
///
/// The two scheduling modes are mutually exclusive per call but may
/// interleave across calls. Choosing `schedule_after` resets the
/// exponential state to `None`, matching the upstream agent's semantics
/// (see `SPEC_FULL.md` §9, open question 3 and `DESIGN.md`).
#[derive(Clone)]
pub struct Retrier {
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    mode: Arc<Mutex<Mode>>,
}

impl Retrier {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, sleeper: Arc::new(TokioSleeper), mode: Arc::new(Mutex::new(Mode::None)) }
    }

    pub fn with_sleeper(backoff: Backoff, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { backoff, sleeper, mode: Arc::new(Mutex::new(Mode::None)) }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Fix the next delay to exactly `d`, discarding exponential state.
    pub fn schedule_after(&self, d: Duration) {
        *self.mode.lock().expect("Retrier.mode poisoned") =
            Mode::Fixed { scheduled_at: Instant::now(), delay: d };
    }

    /// Take the next sample from the backoff and schedule it. Returns the
    /// delay chosen, for telemetry/logging.
    pub fn schedule_with_backoff(&self) -> Duration {
        let delay = self.backoff.next();
        *self.mode.lock().expect("Retrier.mode poisoned") =
            Mode::Exponential { scheduled_at: Instant::now(), delay };
        delay
    }

    /// Like [`Self::schedule_with_backoff`] but honours a per-call max
    /// override (e.g. a server-provided `MaxBackOff`).
    pub fn schedule_with_backoff_bounded(&self, max_override: Duration) -> Duration {
        let delay = self.backoff.next_bounded(max_override);
        *self.mode.lock().expect("Retrier.mode poisoned") =
            Mode::Exponential { scheduled_at: Instant::now(), delay };
        delay
    }

    /// Milliseconds until the scheduled wakeup. Negative means "ready now".
    pub fn remaining_millis(&self) -> i64 {
        let mode = *self.mode.lock().expect("Retrier.mode poisoned");
        match mode {
            Mode::None => -1,
            Mode::Fixed { scheduled_at, delay } | Mode::Exponential { scheduled_at, delay } => {
                let elapsed = scheduled_at.elapsed();
                delay.as_millis() as i64 - elapsed.as_millis() as i64
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.remaining_millis() <= 0
    }

    /// Sleep until the scheduled wakeup, or return immediately if
    /// `cancel` fires. A cancelled sleep does not advance the backoff's
    /// attempt counter (only `schedule_with_backoff` does that).
    pub async fn sleep(&self, cancel: &CancellationToken) {
        let remaining = self.remaining_millis();
        if remaining <= 0 {
            return;
        }
        sleep_cancellable(&*self.sleeper, Duration::from_millis(remaining as u64), cancel).await;
    }

    /// Reset both the backoff attempt counter and the scheduled mode.
    pub fn reset(&self) {
        self.backoff.reset();
        *self.mode.lock().expect("Retrier.mode poisoned") = Mode::None;
    }
}

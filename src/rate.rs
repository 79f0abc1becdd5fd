//! Validated sampling rate and token-bucket rate limiter.
//!
//! The limiter is grounded on
//! `opentelemetry-sdk/src/trace/sampler/jaeger_remote/rate_limit.rs`'s
//! `LeakyBucket`, adapted from its "spans per second" interface to the
//! `(allowed, effective_rate)` contract.

use crate::error::Error;
use crate::ids::Clock;
use std::sync::Mutex;
use std::time::Instant;

/// A sampling rate validated to lie within `[0.0, 1.0]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rate(f64);

impl Rate {
    pub fn new(value: f64) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&value) || value.is_nan() {
            return Err(Error::RateOutOfRange(value));
        }
        Ok(Rate(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Rate {
    fn default() -> Self {
        Rate(1.0)
    }
}

struct BucketState {
    available: f64,
    last_refill: Instant,
    /// Rolling 1-second window counters for `effective_rate`.
    window_start: Instant,
    window_allowed: u64,
    window_total: u64,
}

/// Token-bucket rate gate. `max_per_second` both sets the refill rate and
/// the bucket capacity.
pub struct Limiter {
    max_per_second: f64,
    state: Mutex<BucketState>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("max_per_second", &self.max_per_second)
            .finish()
    }
}

impl Limiter {
    pub fn new(max_per_second: f64) -> Self {
        let now = Instant::now();
        Limiter {
            max_per_second,
            state: Mutex::new(BucketState {
                available: max_per_second,
                last_refill: now,
                window_start: now,
                window_allowed: 0,
                window_total: 0,
            }),
        }
    }

    /// Attempts to consume one token at `now`. Returns whether the call was
    /// allowed and the effective keep-rate over the trailing ~1s window.
    pub fn allow(&self, now: Instant) -> (bool, f64) {
        let mut state = self.state.lock().unwrap();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * self.max_per_second).min(self.max_per_second);
        state.last_refill = now;

        let allowed = if state.available >= 1.0 {
            state.available -= 1.0;
            true
        } else {
            false
        };

        if now.saturating_duration_since(state.window_start).as_secs_f64() >= 1.0 {
            state.window_start = now;
            state.window_allowed = 0;
            state.window_total = 0;
        }
        state.window_total += 1;
        if allowed {
            state.window_allowed += 1;
        }
        let effective_rate = if state.window_total == 0 {
            1.0
        } else {
            state.window_allowed as f64 / state.window_total as f64
        };

        (allowed, effective_rate)
    }

    /// Convenience wrapper using an injected [`Clock`]'s monotonic tick.
    pub fn allow_now(&self, clock: &dyn Clock) -> (bool, f64) {
        self.allow(clock.now().tick)
    }
}

//! Adaptive per-sink token bucket.
//!
//! Steady state is a plain bucket: `capacity` tokens, refilled at
//! `refill_rate` per second. The adaptive part reacts to the sink's
//! circuit breaker: a trip halves the refill rate (down to `min_refill`),
//! a sustained success streak restores it additively back toward the
//! configured rate. Adjustments are spaced by `adjust_interval` so one bad
//! burst cannot collapse the rate to the floor.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::{config::RateLimiterConfig, internal_events::RateLimiterAdjusted};

/// Successful sends in a row required before the rate is nudged back up.
const RESTORE_STREAK: u32 = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireOutcome {
    Acquired,
    TimedOut,
}

struct Bucket {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    last_adjust: Instant,
    success_streak: u32,
}

pub struct RateLimiter {
    sink: String,
    capacity: f64,
    base_refill: f64,
    min_refill: f64,
    adjust_interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(sink: impl Into<String>, config: &RateLimiterConfig) -> RateLimiter {
        let now = Instant::now();
        RateLimiter {
            sink: sink.into(),
            capacity: config.capacity as f64,
            base_refill: config.refill_rate,
            min_refill: config.min_refill,
            adjust_interval: config.adjust_interval(),
            bucket: Mutex::new(Bucket {
                tokens: config.capacity as f64,
                refill_rate: config.refill_rate,
                last_refill: now,
                last_adjust: now,
                success_streak: 0,
            }),
        }
    }

    /// Acquires `n` tokens, waiting up to `timeout`.
    ///
    /// Waiting is a timed sleep sized to the refill deficit, so callers can
    /// wrap the future in `select!` against a cancellation token.
    pub async fn acquire(&self, n: u64, timeout: Duration) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;
        let want = (n as f64).min(self.capacity);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= want {
                    bucket.tokens -= want;
                    return AcquireOutcome::Acquired;
                }
                let deficit = want - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.refill_rate)
            };
            let now = Instant::now();
            if now + wait > deadline {
                // Not acquirable inside the budget; bail out at the
                // deadline rather than sleeping past it.
                if now >= deadline {
                    return AcquireOutcome::TimedOut;
                }
                tokio::time::sleep_until(deadline).await;
                return self.try_acquire(n);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-waiting acquire.
    pub fn try_acquire(&self, n: u64) -> AcquireOutcome {
        let want = (n as f64).min(self.capacity);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= want {
            bucket.tokens -= want;
            AcquireOutcome::Acquired
        } else {
            AcquireOutcome::TimedOut
        }
    }

    /// Multiplicative decrease, called when the sink's breaker opens.
    pub fn note_breaker_trip(&self) {
        let mut bucket = self.bucket.lock();
        bucket.success_streak = 0;
        if bucket.last_adjust.elapsed() < self.adjust_interval {
            return;
        }
        let from = bucket.refill_rate;
        let to = (from / 2.0).max(self.min_refill);
        if to < from {
            bucket.refill_rate = to;
            bucket.last_adjust = Instant::now();
            RateLimiterAdjusted {
                sink: &self.sink,
                from,
                to,
                reason: "breaker_trip",
            }
            .emit();
        }
    }

    /// Additive restore, called per successful batch send.
    pub fn note_success(&self) {
        let mut bucket = self.bucket.lock();
        bucket.success_streak = bucket.success_streak.saturating_add(1);
        if bucket.refill_rate >= self.base_refill
            || bucket.success_streak < RESTORE_STREAK
            || bucket.last_adjust.elapsed() < self.adjust_interval
        {
            return;
        }
        let from = bucket.refill_rate;
        let step = self.base_refill / 10.0;
        let to = (from + step).min(self.base_refill);
        bucket.refill_rate = to;
        bucket.last_adjust = Instant::now();
        bucket.success_streak = 0;
        RateLimiterAdjusted {
            sink: &self.sink,
            from,
            to,
            reason: "success_streak",
        }
        .emit();
    }

    /// Current refill rate, tokens per second.
    pub fn current_rate(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.refill_rate
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * bucket.refill_rate)
            .min(self.capacity);
    }
}

//! Per-sink circuit breaker.
//!
//! Three states: `closed` (calls flow), `open` (calls rejected until the
//! reset timeout elapses), `half_open` (a single probe is let through; its
//! outcome decides the next state). State transitions take a mutex; the
//! request/success/failure counters are plain atomics since the hot path
//! only increments them.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{config::CircuitBreakerConfig, internal_events::BreakerStateChanged};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Whether the half-open probe slot is taken.
    probe_inflight: bool,
    last_transition: DateTime<Utc>,
}

pub struct CircuitBreaker {
    sink: String,
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view for the stats snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_transition: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn new(sink: impl Into<String>, config: &CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker {
            sink: sink.into(),
            max_failures: config.max_failures,
            reset_timeout: config.reset_timeout(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_inflight: false,
                last_transition: Utc::now(),
            }),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Gate for an outgoing call.
    ///
    /// Returns false while `open` (before the reset deadline) and while a
    /// half-open probe is already in flight; no underlying operation may be
    /// invoked in that case. The first call after the reset deadline flips
    /// the breaker to `half_open` and is admitted as the probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                true
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return false;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.probe_inflight = true;
                self.requests.fetch_add(1, Ordering::Relaxed);
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_inflight {
                    return false;
                }
                inner.probe_inflight = true;
                self.requests.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_inflight = false;
        if inner.state != BreakerState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.probe_inflight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Contract-level wrapper: runs `op` only if the breaker admits it.
    ///
    /// `Err(None)` means the circuit was open and `op` was never invoked.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, Option<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return Err(None);
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(Some(error))
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_transition: inner.last_transition,
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Utc::now();
        BreakerStateChanged {
            sink: &self.sink,
            from: from.as_str(),
            to: to.as_str(),
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32, reset_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                max_failures,
                reset_timeout_secs: reset_secs,
            },
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker(3, 30);
        assert_eq!(cb.state(), BreakerState::Closed);

        for _ in 0..2 {
            assert!(cb.allow_request());
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(3, 30);
        for _ in 0..2 {
            assert!(cb.allow_request());
            cb.record_failure();
        }
        assert!(cb.allow_request());
        cb.record_success();

        for _ in 0..2 {
            assert!(cb.allow_request());
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let cb = breaker(1, 0);
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // reset_timeout=0, so the next request becomes the probe.
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        // Concurrent caller is rejected while the probe is in flight.
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 0);
        assert!(cb.allow_request());
        cb.record_failure();
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn execute_never_invokes_while_open() {
        let cb = breaker(1, 3_600);
        let result: Result<(), Option<&str>> = cb.execute(|| async { Err("boom") }).await;
        assert_eq!(result, Err(Some("boom")));
        assert_eq!(cb.state(), BreakerState::Open);

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), Option<&str>> = cb
            .execute(|| {
                invoked.store(true, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(result, Err(None));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn snapshot_reports_counters() {
        let cb = breaker(5, 30);
        assert!(cb.allow_request());
        cb.record_success();
        assert!(cb.allow_request());
        cb.record_failure();

        let snap = cb.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.state, BreakerState::Closed);
    }
}

//! Circuit breaker shared by every LLM caller.
//!
//! Closed → open after `failure_threshold` consecutive failures; open →
//! half-open once `reset_timeout` has elapsed; half-open → closed after
//! `success_threshold` consecutive successes, or straight back to open on a
//! single failure. The open→half-open promotion is evaluated lazily against
//! the monotonic clock at each observation, which is equivalent to a delayed
//! reset event and leaves no timer to orphan on shutdown.

use crate::telemetry::{EventPayload, TelemetryHub};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning; see `CircuitBreakerConfig` for the serde-facing form.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Pure snapshot of the breaker, as returned by [`CircuitBreaker::state`].
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    telemetry: Arc<TelemetryHub>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings, telemetry: Arc<TelemetryHub>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            telemetry,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_at: None,
                last_failure_reason: None,
            }),
        })
    }

    /// True when a new LLM call may proceed (closed or half-open).
    /// Emits `circuit_breaker.rejected` telemetry when refusing.
    pub fn allow(&self) -> bool {
        if !self.settings.enabled {
            return true;
        }
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                self.telemetry.emit(
                    None,
                    EventPayload::CircuitRejected {
                        state: inner.state,
                        failure_count: inner.failure_count,
                    },
                );
                false
            }
        }
    }

    pub fn record_failure(&self, reason: &str) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.last_failure_at = Some(Utc::now());
        inner.last_failure_reason = Some(reason.to_string());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.settings.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open, Some(reason));
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                // Single probe failure reopens immediately, counters reset.
                inner.failure_count = 0;
                inner.success_count = 0;
                self.transition(&mut inner, BreakerState::Open, Some(reason));
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_success(&self) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.settings.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, BreakerState::Closed, None);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Administrative reset: forces closed with zeroed counters.
    pub fn reset(&self) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed, Some("reset"));
        }
    }

    pub fn state(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    fn promote_if_due(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.settings.reset_timeout);
        if due {
            inner.success_count = 0;
            self.transition(inner, BreakerState::HalfOpen, None);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, reason: Option<&str>) {
        let from = inner.state;
        inner.state = to;
        self.telemetry.emit(
            None,
            EventPayload::CircuitStateChange {
                from,
                to,
                failure_count: inner.failure_count,
                reason: reason.map(ToString::to_string),
            },
        );
        tracing::debug!(?from, ?to, reason = ?reason, "circuit breaker transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryHub;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            BreakerSettings {
                enabled: true,
                failure_threshold,
                success_threshold,
                reset_timeout: Duration::from_secs(60),
            },
            TelemetryHub::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_closed_open_half_open_closed() {
        let b = breaker(2, 1);
        assert!(b.allow());

        b.record_failure("http");
        assert_eq!(b.state().state, BreakerState::Closed);
        b.record_failure("http");
        assert_eq!(b.state().state, BreakerState::Open);
        assert!(!b.allow());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(b.state().state, BreakerState::HalfOpen);
        assert!(b.allow());

        b.record_success();
        let snapshot = b.state();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_counters_reset() {
        let b = breaker(1, 2);
        b.record_failure("http");
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(b.state().state, BreakerState::HalfOpen);

        b.record_success();
        b.record_failure("http");
        let snapshot = b.state();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.success_count, 0);
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_failure_count() {
        let b = breaker(2, 1);
        b.record_failure("http");
        b.record_success();
        b.record_failure("http");
        assert_eq!(b.state().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_always_allows() {
        let b = CircuitBreaker::new(
            BreakerSettings {
                enabled: false,
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(1),
            },
            TelemetryHub::new(),
        );
        b.record_failure("http");
        b.record_failure("http");
        assert!(b.allow());
        assert_eq!(b.state().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_emits_telemetry() {
        let hub = TelemetryHub::new();
        let b = CircuitBreaker::new(
            BreakerSettings {
                enabled: true,
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
            hub.clone(),
        );
        let mut rx = hub.subscribe();
        b.record_failure("http");
        assert!(!b.allow());

        let mut saw_rejected = false;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "circuit_breaker.rejected" {
                saw_rejected = true;
            }
        }
        assert!(saw_rejected);
    }
}

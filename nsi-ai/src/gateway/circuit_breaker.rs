//! Per-provider circuit breaker
//!
//! `closed -> open` after `failure_threshold` consecutive failures, `open -> half_open`
//! once the cool-down has elapsed, `half_open -> closed` on a trial success and
//! `half_open -> open` on a trial failure. In `half_open` at most
//! `half_open_max_calls` trial calls are admitted at a time.
//!
//! Every transition is logged and broadcast as `NsiEvent::CircuitStateChanged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use nsi_common::config::CircuitBreakerSettings;
use nsi_common::events::{EventBus, NsiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker telemetry for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    /// Consecutive failures (reset by a success)
    pub failure_count: u32,
    /// Successful calls since start
    pub success_count: u64,
    pub total_failures: u64,
    pub can_proceed: bool,
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Time left before an open breaker admits a trial call
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    success_count: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    trials_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(
        provider: impl Into<String>,
        settings: &CircuitBreakerSettings,
        event_bus: Option<EventBus>,
    ) -> Self {
        Self {
            provider: provider.into(),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_millis(settings.cooldown_ms),
            half_open_max_calls: settings.half_open_max_calls.max(1),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                success_count: 0,
                total_failures: 0,
                opened_at: None,
                last_failure_time: None,
                trials_in_flight: 0,
            }),
            event_bus,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }

    /// Current state, applying a due `open -> half_open` transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open && self.cooldown_elapsed(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
        inner.state
    }

    /// Whether a call would be admitted right now (does not reserve a trial slot)
    pub fn can_proceed(&self) -> bool {
        let inner = self.lock();
        self.can_proceed_locked(&inner)
    }

    fn can_proceed_locked(&self, inner: &BreakerInner) -> bool {
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(inner),
            CircuitState::HalfOpen => inner.trials_in_flight < self.half_open_max_calls,
        }
    }

    /// Admit one call; in `half_open` this reserves a trial slot
    ///
    /// Every admitted call must end in `record_success`, `record_failure` or `release`.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return false;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trials_in_flight = 1;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.half_open_max_calls {
                    inner.trials_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back an admitted call that was never dispatched
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.trials_in_flight = 0;
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // Late answer from a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.trials_in_flight = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let cooldown_remaining_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(self.cooldown.saturating_sub(opened.elapsed()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.success_count,
            total_failures: inner.total_failures,
            can_proceed: self.can_proceed_locked(&inner),
            last_failure_time: inner.last_failure_time,
            cooldown_remaining_ms,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;

        if new_state == CircuitState::Open {
            warn!(
                provider = %self.provider,
                failure_count = inner.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit opened"
            );
        } else {
            info!(
                provider = %self.provider,
                old_state = %old_state,
                new_state = %new_state,
                "Circuit state changed"
            );
        }

        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(NsiEvent::CircuitStateChanged {
                provider: self.provider.clone(),
                old_state: old_state.to_string(),
                new_state: new_state.to_string(),
                failure_count: inner.consecutive_failures,
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "A",
            &CircuitBreakerSettings {
                failure_threshold: threshold,
                cooldown_ms,
                half_open_max_calls: 1,
            },
            None,
        )
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_proceed());
        assert!(!cb.try_acquire());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
        assert_eq!(cb.snapshot().total_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(cb.can_proceed());
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire());
        assert!(!cb.snapshot().can_proceed);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(cb.try_acquire());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let snapshot = cb.snapshot();
        assert!(!snapshot.can_proceed);
        assert!(snapshot.cooldown_remaining_ms.unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_trial_slot() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(cb.try_acquire());
        cb.release();
        assert!(cb.try_acquire());
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let cb = CircuitBreaker::new(
            "B",
            &CircuitBreakerSettings {
                failure_threshold: 1,
                cooldown_ms: 60_000,
                half_open_max_calls: 1,
            },
            Some(bus.clone()),
        );
        cb.record_failure();

        match rx.recv().await.unwrap() {
            NsiEvent::CircuitStateChanged {
                provider,
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(provider, "B");
                assert_eq!(old_state, "closed");
                assert_eq!(new_state, "open");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

//! rds-breaker
//!
//! Three-state circuit breaker (spec §4.4, C4) guarding calls to a
//! `Backend`. The state shape is grounded on `mqk-integrity::ArmState` —
//! a pure, named-reason state machine with explicit transition functions
//! and no hidden mutation — generalized from a single sticky
//! "armed/disarmed" flag into the full closed/open/half-open cycle spec
//! §4.4 requires. The broadcast-every-transition wiring is grounded on
//! `mqk-daemon::AppState`'s shared `broadcast::Sender<BusMsg>`, which
//! every handler reads state changes from. Neither teacher file is async
//! or three-state on its own — `ArmState` is explicitly pure and
//! IO-free, `AppState`'s bus carries heartbeats and status, not breaker
//! transitions — so the async, observable three-state cycle here is this
//! crate's own synthesis of the two for the hot request path spec §4.4
//! puts it on.

use std::time::{Duration, Instant};

use rds_error::StoreError;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};

/// Position in the three-state machine (GLOSSARY: "Circuit state").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a transition happened, carried on `CircuitEvent` (SPEC_FULL §2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionReason {
    FailureThresholdReached,
    CooldownElapsed,
    SuccessThresholdReached,
    AnyFailureInHalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct CircuitEvent {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: Instant,
    pub reason: TransitionReason,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    in_flight_half_open: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            in_flight_half_open: 0,
        }
    }
}

/// A token proving a call was admitted. The caller MUST resolve it with
/// `record_success` or `record_failure` (spec §4.4) — consuming `self`
/// prevents recording twice or forgetting to record at all.
#[must_use = "an admitted call must record its outcome via record_success/record_failure"]
pub struct Permit {
    was_half_open_probe: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
    events_tx: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events_tx, _rx) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::new()),
            config,
            events_tx,
        }
    }

    pub fn current_state(&self) -> CircuitState {
        // Best-effort synchronous snapshot; `try_lock` avoids forcing every
        // caller of a cheap getter into an async context. Contention here
        // is rare (the lock is held only for the duration of admit/record).
        self.inner
            .try_lock()
            .map(|g| g.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events_tx.subscribe()
    }

    /// Admits a call, or rejects it with `CircuitOpen` (spec §4.4).
    pub async fn admit(&self) -> Result<Permit, StoreError> {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.open_duration)
                .unwrap_or(false);
            if elapsed {
                self.transition(&mut inner, CircuitState::HalfOpen, TransitionReason::CooldownElapsed);
            } else {
                return Err(StoreError::CircuitOpen);
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                was_half_open_probe: false,
            }),
            CircuitState::HalfOpen => {
                if inner.in_flight_half_open < self.config.half_open_max_requests {
                    inner.in_flight_half_open += 1;
                    Ok(Permit {
                        was_half_open_probe: true,
                    })
                } else {
                    Err(StoreError::CircuitOpen)
                }
            }
            CircuitState::Open => unreachable!("handled above"),
        }
    }

    pub async fn record_success(&self, permit: Permit) {
        let mut inner = self.inner.lock().await;
        if permit.was_half_open_probe {
            inner.in_flight_half_open = inner.in_flight_half_open.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, TransitionReason::SuccessThresholdReached);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, permit: Permit) {
        let mut inner = self.inner.lock().await;
        if permit.was_half_open_probe {
            inner.in_flight_half_open = inner.in_flight_half_open.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, TransitionReason::FailureThresholdReached);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, TransitionReason::AnyFailureInHalfOpen);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, reason: TransitionReason) {
        let from = inner.state;
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.in_flight_half_open = 0;
        inner.opened_at = if to == CircuitState::Open {
            Some(Instant::now())
        } else {
            None
        };
        tracing::info!(?from, ?to, ?reason, "circuit breaker transition");
        let _ = self.events_tx.send(CircuitEvent {
            from,
            to,
            at: Instant::now(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, half_open_max: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold,
            success_threshold,
            open_duration: Duration::from_millis(20),
            half_open_max_requests: half_open_max,
        })
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_then_rejects() {
        let b = breaker(2, 1, 1);
        for _ in 0..2 {
            let p = b.admit().await.unwrap();
            b.record_failure(p).await;
        }
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(matches!(b.admit().await, Err(StoreError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_caps_concurrent_probes() {
        let b = breaker(1, 2, 1);
        let p = b.admit().await.unwrap();
        b.record_failure(p).await;
        assert_eq!(b.current_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe = b.admit().await.unwrap();
        assert_eq!(b.current_state(), CircuitState::HalfOpen);
        // Second concurrent probe is rejected while the first is in flight.
        assert!(matches!(b.admit().await, Err(StoreError::CircuitOpen)));
        b.record_success(probe).await;
    }

    #[tokio::test]
    async fn closes_after_success_threshold_in_half_open() {
        let b = breaker(1, 2, 1);
        let p = b.admit().await.unwrap();
        b.record_failure(p).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let p1 = b.admit().await.unwrap();
        b.record_success(p1).await;
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        let p2 = b.admit().await.unwrap();
        b.record_success(p2).await;
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn any_failure_in_half_open_reopens() {
        let b = breaker(1, 3, 1);
        let p = b.admit().await.unwrap();
        b.record_failure(p).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe = b.admit().await.unwrap();
        b.record_failure(probe).await;
        assert_eq!(b.current_state(), CircuitState::Open);
    }
}

//! Circuit breaker (§4.1): a three-state machine admitting or rejecting
//! calls to a single target based on consecutive failure/success counts.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};
use crate::events::{EventListeners, FisoEvent};

/// Breaker configuration. Defaults match §4.1: 5 consecutive failures trip
/// the breaker, 3 consecutive half-open successes close it, 30s before a
/// trial request is let through again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Rejection reason for an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit-open")]
    CircuitOpen,
}

#[derive(Debug)]
pub struct BreakerStateTransition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: Instant,
}

impl FisoEvent for BreakerStateTransition {
    fn event_type(&self) -> &'static str {
        "breaker_state_transition"
    }
    fn timestamp(&self) -> Instant {
        self.timestamp
    }
    fn target_name(&self) -> &str {
        &self.target
    }
}

struct Inner {
    state_atomic: AtomicU8,
    guarded: Mutex<Guarded>,
}

struct Guarded {
    failures: u32,
    successes: u32,
    last_failure_time: Option<Instant>,
}

/// A single target's circuit breaker. Clone is cheap (shares the inner
/// `Arc`); every clone observes the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Arc<Inner>,
    listeners: Arc<EventListeners<BreakerStateTransition>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Arc::new(Inner {
                state_atomic: AtomicU8::new(CircuitState::Closed as u8),
                guarded: Mutex::new(Guarded {
                    failures: 0,
                    successes: 0,
                    last_failure_time: None,
                }),
            }),
            listeners: Arc::new(EventListeners::new()),
        }
    }

    /// Registers a listener. Must be called before the breaker is cloned
    /// into other call sites, since clones share the same listener set only
    /// by reference at construction time.
    pub fn with_listener<L>(mut self, listener: L) -> Self
    where
        L: crate::events::EventListener<BreakerStateTransition> + 'static,
    {
        let listeners = Arc::make_mut(&mut self.listeners);
        listeners.add(listener);
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state_atomic.load(Ordering::Acquire))
    }

    /// Decides whether a call may proceed. Mutates state when a reset
    /// timeout has elapsed (Open -> HalfOpen).
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut guarded = self.inner.guarded.lock().unwrap();
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed_ok = guarded
                    .last_failure_time
                    .map(|t| self.clock.now().saturating_duration_since(t) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed_ok {
                    guarded.successes = 0;
                    self.transition(&mut guarded, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(BreakerError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guarded = self.inner.guarded.lock().unwrap();
        match self.state() {
            CircuitState::Closed => {
                guarded.failures = 0;
            }
            CircuitState::HalfOpen => {
                guarded.successes += 1;
                if guarded.successes >= self.config.success_threshold {
                    guarded.failures = 0;
                    guarded.successes = 0;
                    self.transition(&mut guarded, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut guarded = self.inner.guarded.lock().unwrap();
        guarded.last_failure_time = Some(self.clock.now());
        match self.state() {
            CircuitState::Closed => {
                guarded.failures += 1;
                if guarded.failures >= self.config.failure_threshold {
                    self.transition(&mut guarded, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                guarded.successes = 0;
                self.transition(&mut guarded, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, _guarded: &mut Guarded, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.inner.state_atomic.store(to as u8, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::info!(target = %self.name, from = ?from, to = ?to, "circuit breaker state transition");

        #[cfg(feature = "metrics")]
        metrics::gauge!("fiso_breaker_state", "target" => self.name.clone()).set(to as u8 as f64);

        self.listeners.emit(&BreakerStateTransition {
            target: self.name.clone(),
            from,
            to,
            timestamp: self.clock.now(),
        });
    }
}

/// Per-target breaker registry, so Link/Flow can look up a breaker by
/// target name without each call site threading one through explicitly.
#[derive(Default, Clone)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<std::collections::HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` the first
    /// time it's seen. Reload preserves the existing breaker so its
    /// counters survive a config swap (§9).
    pub fn get_or_insert(&self, name: &str, config: BreakerConfig) -> CircuitBreaker {
        let mut guard = self.inner.lock().unwrap();
        guard
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    /// Drops entries whose target name is no longer present, per §9's
    /// reload semantics.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.inner.lock().unwrap().retain(|k, _| keep(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: ManualClock) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            "svc",
            BreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(1),
            },
            Arc::new(clock),
        )
    }

    #[test]
    fn trips_after_failure_threshold_and_recovers() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.try_acquire().is_err());

        clock.advance(Duration::from_millis(1100));
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_millis(1100));
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn closed_success_resets_failure_counter() {
        let clock = ManualClock::new();
        let breaker = breaker(clock);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_preserves_breaker_across_reload() {
        let registry = BreakerRegistry::new();
        let b1 = registry.get_or_insert("svc", BreakerConfig::default());
        b1.record_failure();
        let b2 = registry.get_or_insert("svc", BreakerConfig::default());
        assert_eq!(b2.state(), CircuitState::Closed);
        // same underlying breaker: failure count of 1 should persist
        b2.record_failure();
        b2.record_failure();
        b2.record_failure();
        b2.record_failure();
        assert_eq!(b2.state(), CircuitState::Open);
    }
}

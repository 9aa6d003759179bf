//! Per-target token-bucket rate limiter (§4.2).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::{system_clock, SharedClock};

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Registry of per-target token buckets. `Allow` is non-blocking: it either
/// consumes a token immediately or returns `false`.
#[derive(Clone)]
pub struct RateLimiter {
    clock: SharedClock,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `rate <= 0` removes the entry, making the target unlimited.
    /// `burst <= 0` defaults to `max(1, floor(rate))`.
    pub fn set(&self, name: &str, rate: f64, burst: f64) {
        let mut guard = self.buckets.lock().unwrap();
        if rate <= 0.0 {
            guard.remove(name);
            return;
        }
        let burst = if burst <= 0.0 {
            (rate.floor() as i64).max(1) as f64
        } else {
            burst
        };
        guard.insert(name.to_string(), Bucket::new(rate, burst, self.clock.now()));
    }

    /// `true` for unconfigured or unlimited targets; otherwise consumes one
    /// token if available.
    pub fn allow(&self, name: &str) -> bool {
        let mut guard = self.buckets.lock().unwrap();
        match guard.get_mut(name) {
            Some(bucket) => bucket.try_consume(self.clock.now()),
            None => true,
        }
    }

    pub fn remove(&self, name: &str) {
        self.buckets.lock().unwrap().remove(name);
    }

    /// Drops entries whose target name is no longer present.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.buckets.lock().unwrap().retain(|k, _| keep(k));
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn unconfigured_target_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.allow("svc"));
        }
    }

    #[test]
    fn burst_admits_then_rejects_until_refill() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(Arc::new(clock.clone()));
        limiter.set("svc", 1.0, 3.0);

        assert!(limiter.allow("svc"));
        assert!(limiter.allow("svc"));
        assert!(limiter.allow("svc"));
        assert!(!limiter.allow("svc"));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow("svc"));
        assert!(!limiter.allow("svc"));
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let limiter = RateLimiter::new();
        limiter.set("svc", 1.0, 1.0);
        assert!(limiter.allow("svc"));
        assert!(!limiter.allow("svc"));

        limiter.set("svc", 0.0, 0.0);
        assert!(limiter.allow("svc"));
    }

    #[test]
    fn burst_defaults_to_floor_rate_when_non_positive() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(Arc::new(clock));
        limiter.set("svc", 5.0, 0.0);
        for _ in 0..5 {
            assert!(limiter.allow("svc"));
        }
        assert!(!limiter.allow("svc"));
    }
}

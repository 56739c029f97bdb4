//! Per-agent circuit breaker.
//!
//! A rolling-window failure count opens the breaker; while open the
//! agent is not eligible. After the cooldown one probe assignment is
//! allowed: success closes the breaker, failure re-opens it with
//! exponential backoff up to a cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    /// Ceiling for the exponential re-open backoff.
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_backoff: Duration::from_secs(480),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_inflight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: State,
    failures: VecDeque<Instant>,
    /// Consecutive opens, drives the backoff exponent.
    opens: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: State::Closed,
            failures: VecDeque::new(),
            opens: 0,
        }
    }

    /// Whether an assignment may be attempted right now, and reserve the
    /// half-open probe slot when that is what this attempt is.
    pub fn acquire(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { until } => {
                if now >= until {
                    self.state = State::HalfOpen {
                        probe_inflight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_inflight } => {
                if probe_inflight {
                    false
                } else {
                    self.state = State::HalfOpen {
                        probe_inflight: true,
                    };
                    true
                }
            }
        }
    }

    /// Non-reserving view of availability.
    pub fn is_available(&self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { until } => now >= until,
            State::HalfOpen { probe_inflight } => !probe_inflight,
        }
    }

    pub fn record_success(&mut self) {
        self.state = State::Closed;
        self.failures.clear();
        self.opens = 0;
    }

    pub fn record_failure(&mut self, now: Instant) {
        if let State::HalfOpen { .. } = self.state {
            self.open(now);
            return;
        }
        self.failures.push_back(now);
        let horizon = now.checked_sub(self.config.window);
        if let Some(horizon) = horizon {
            while self.failures.front().is_some_and(|t| *t < horizon) {
                self.failures.pop_front();
            }
        }
        if self.failures.len() as u32 >= self.config.failure_threshold {
            self.open(now);
        }
    }

    fn open(&mut self, now: Instant) {
        self.opens += 1;
        let exponent = self.opens.saturating_sub(1).min(16);
        let backoff = self
            .config
            .cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff);
        self.state = State::Open {
            until: now + backoff,
        };
        self.failures.clear();
    }

    pub fn is_open(&self, now: Instant) -> bool {
        matches!(self.state, State::Open { until } if now < until)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_backoff: Duration::from_secs(240),
        }
    }

    #[test]
    fn closed_until_threshold() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(breaker.acquire(now));
        breaker.record_failure(now);
        assert!(!breaker.acquire(now));
        assert!(breaker.is_open(now));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let mut breaker = CircuitBreaker::new(config());
        let start = Instant::now();
        breaker.record_failure(start);
        breaker.record_failure(start);
        // Third failure arrives after the first two left the window.
        breaker.record_failure(start + Duration::from_secs(120));
        assert!(breaker.acquire(start + Duration::from_secs(121)));
    }

    #[test]
    fn half_open_allows_single_probe() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        let after_cooldown = now + Duration::from_secs(31);
        assert!(breaker.acquire(after_cooldown));
        // Second attempt while the probe is in flight is refused.
        assert!(!breaker.acquire(after_cooldown));
    }

    #[test]
    fn probe_success_closes() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        let later = now + Duration::from_secs(31);
        assert!(breaker.acquire(later));
        breaker.record_success();
        assert!(breaker.acquire(later));
        assert!(breaker.acquire(later));
    }

    #[test]
    fn probe_failure_reopens_with_backoff() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        let probe_at = now + Duration::from_secs(31);
        assert!(breaker.acquire(probe_at));
        breaker.record_failure(probe_at);
        // Second open doubles the cooldown: unavailable at +30s.
        assert!(!breaker.acquire(probe_at + Duration::from_secs(31)));
        assert!(breaker.acquire(probe_at + Duration::from_secs(61)));
    }

    #[test]
    fn backoff_is_capped() {
        let mut breaker = CircuitBreaker::new(config());
        let mut now = Instant::now();
        // Drive many consecutive opens through failed probes.
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        for _ in 0..10 {
            now += Duration::from_secs(1000);
            assert!(breaker.acquire(now));
            breaker.record_failure(now);
        }
        // Even after many opens the wait never exceeds the cap.
        assert!(breaker.acquire(now + Duration::from_secs(241)));
    }
}

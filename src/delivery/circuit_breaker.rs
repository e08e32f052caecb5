//! Consecutive-failure circuit breaker.
//!
//! The breaker opens once `threshold` batches in a row have failed and the
//! last failure is younger than `open_duration`. When that cooldown has
//! passed it resets itself and lets traffic through again; there is no
//! half-open trial request.

use crate::config::types::CircuitBreakerConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests fail fast without touching the network
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_duration,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.threshold, config.open_duration)
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Whether calls should be rejected right now. Resets the failure count
    /// when the cooldown since the last failure has elapsed.
    pub fn is_open(&self) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let Some(last_failure) = counters.last_failure else {
            return false;
        };

        if last_failure.elapsed() >= self.open_duration {
            if counters.consecutive_failures >= self.threshold {
                info!(
                    failures = counters.consecutive_failures,
                    "Circuit breaker cooldown elapsed, admitting traffic"
                );
            }
            counters.consecutive_failures = 0;
            counters.last_failure = None;
            return false;
        }

        counters.consecutive_failures >= self.threshold
    }

    pub fn record_success(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.consecutive_failures = 0;
        counters.last_failure = None;
    }

    pub fn record_failure(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
        counters.last_failure = Some(Instant::now());
        if counters.consecutive_failures == self.threshold {
            warn!(
                failures = counters.consecutive_failures,
                open_for_secs = self.open_duration.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.counters.lock().unwrap().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_cooldown_readmits() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
        breaker.record_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(80));
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failure_during_cooldown_extends_it() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.is_open());
    }

    #[test]
    fn test_concurrent_failures_counted() {
        let breaker = Arc::new(CircuitBreaker::new(8, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.record_failure())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(breaker.consecutive_failures(), 8);
        assert!(breaker.is_open());
    }
}

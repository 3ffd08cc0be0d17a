//! Circuit breakers for downstream dependencies.
//!
//! Closed → open after `failure_threshold` consecutive failures; open →
//! half-open after `reset_timeout`; half-open → closed after
//! `success_threshold` consecutive successes (a single failure re-opens).
//!
//! Security-critical dependencies (database, providers) fail closed: when
//! their breaker is open the pipeline denies with `SERVICE_UNAVAILABLE`.
//! Observability dependencies fail open.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Deny requests while the dependency is down.
    FailClosed,
    /// Proceed and record the incident as a warning.
    FailOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. An open breaker transitions to half-open
    /// once the reset timeout has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
            CircuitState::Closed => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

/// Per-dependency breakers with their failure policy.
pub struct FailsafeSet {
    breakers: HashMap<&'static str, (CircuitBreaker, FailureMode)>,
}

impl FailsafeSet {
    pub fn with_defaults() -> Self {
        let mut breakers = HashMap::new();
        for name in ["database", "provider"] {
            breakers.insert(
                name,
                (CircuitBreaker::new(BreakerConfig::default()), FailureMode::FailClosed),
            );
        }
        for name in ["cache", "audit_log", "metrics"] {
            breakers.insert(
                name,
                (CircuitBreaker::new(BreakerConfig::default()), FailureMode::FailOpen),
            );
        }
        FailsafeSet { breakers }
    }

    /// None when the dependency is unknown (treated as allowed).
    pub fn check(&self, dependency: &str) -> Option<(bool, FailureMode)> {
        self.breakers
            .get(dependency)
            .map(|(breaker, mode)| (breaker.allow(), *mode))
    }

    pub fn record_success(&self, dependency: &str) {
        if let Some((breaker, _)) = self.breakers.get(dependency) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, dependency: &str) {
        if let Some((breaker, _)) = self.breakers.get(dependency) {
            breaker.record_failure();
        }
    }

    /// Whether a fail-closed dependency is currently refusing calls.
    pub fn is_blocked(&self, dependency: &str) -> bool {
        match self.check(dependency) {
            Some((false, FailureMode::FailClosed)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(10),
            success_threshold: 2,
        }
    }

    #[test]
    fn test_starts_closed() {
        let b = CircuitBreaker::new(quick_config());
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = CircuitBreaker::new(quick_config());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = CircuitBreaker::new(quick_config());
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout() {
        let b = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(!b.allow());
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.allow());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let b = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let b = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_failsafe_set_policies() {
        let set = FailsafeSet::with_defaults();
        let (allowed, mode) = set.check("database").unwrap();
        assert!(allowed);
        assert_eq!(mode, FailureMode::FailClosed);

        let (_, mode) = set.check("audit_log").unwrap();
        assert_eq!(mode, FailureMode::FailOpen);

        assert!(set.check("unknown").is_none());
    }

    #[test]
    fn test_failsafe_blocked_only_when_fail_closed_open() {
        let set = FailsafeSet::with_defaults();
        assert!(!set.is_blocked("database"));
        for _ in 0..5 {
            set.record_failure("database");
        }
        assert!(set.is_blocked("database"));

        // Fail-open deps never block
        for _ in 0..5 {
            set.record_failure("audit_log");
        }
        assert!(!set.is_blocked("audit_log"));
    }
}

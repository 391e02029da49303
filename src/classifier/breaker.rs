//! Circuit breaker over the classifier endpoint: closed/open/half-open,
//! isolating a failing model from wasting retry budget on every message in
//! a batch. `F` consecutive failures opens the breaker for `T` seconds;
//! after that it admits `H` half-open trial calls, closing again on
//! success or reopening on the first failure.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audit::{AuditChain, EventType};
use crate::config::ClassifierConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_trials_admitted: u32,
}

pub struct CircuitBreaker {
    subsystem: String,
    failure_threshold: u32,
    open_duration: Duration,
    half_open_trials: u32,
    inner: Mutex<Inner>,
    audit: Option<Arc<AuditChain>>,
}

impl CircuitBreaker {
    pub fn new(subsystem: impl Into<String>, config: &ClassifierConfig) -> Self {
        Self {
            subsystem: subsystem.into(),
            failure_threshold: config.breaker_failure_threshold,
            open_duration: Duration::from_secs(config.breaker_open_secs),
            half_open_trials: config.breaker_half_open_trials.max(1),
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_trials_admitted: 0,
            }),
            audit: None,
        }
    }

    /// Record every state transition (`closed` -> `open` -> `half_open` ->
    /// `closed`/`open`) as a `config_changed` audit entry.
    pub fn with_audit(mut self, audit: Arc<AuditChain>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn record_transition(&self, to: &str) {
        if let Some(audit) = &self.audit {
            let _ = audit.append(
                EventType::ConfigChanged,
                "",
                "",
                "",
                0.0,
                serde_json::json!({ "subsystem": self.subsystem, "breaker_state": to }),
            );
        }
    }

    /// Call before attempting the underlying request. Errors if the
    /// breaker is open and the cooldown hasn't elapsed, or if already at
    /// capacity for half-open trials.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let opened_at = inner.opened_at.expect("opened_at set when entering Open");
                let elapsed = opened_at.elapsed();
                if elapsed >= self.open_duration {
                    inner.state = State::HalfOpen;
                    inner.half_open_trials_admitted = 1;
                    drop(inner);
                    self.record_transition("half_open");
                    Ok(())
                } else {
                    let remaining = self.open_duration - elapsed;
                    Err(Error::breaker_open(self.subsystem.clone(), remaining.as_secs().max(1)))
                }
            }
            State::HalfOpen => {
                if inner.half_open_trials_admitted < self.half_open_trials {
                    inner.half_open_trials_admitted += 1;
                    Ok(())
                } else {
                    Err(Error::breaker_open(self.subsystem.clone(), self.open_duration.as_secs()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        let was_open = inner.state != State::Closed;
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_trials_admitted = 0;
        drop(inner);
        if was_open {
            self.record_transition("closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let opened = match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_trials_admitted = 0;
                true
            }
            State::Closed | State::Open => {
                inner.consecutive_failures += 1;
                if inner.state == State::Closed && inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);
        if opened {
            self.record_transition("open");
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == State::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, open_secs: u64, half_open_trials: u32) -> ClassifierConfig {
        let mut config = ClassifierConfig::default();
        config.breaker_failure_threshold = threshold;
        config.breaker_open_secs = open_secs;
        config.breaker_half_open_trials = half_open_trials;
        config
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("classifier", &config(3, 60, 1));
        for _ in 0..2 {
            breaker.admit().unwrap();
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        breaker.admit().unwrap();
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let breaker = CircuitBreaker::new("classifier", &config(3, 60, 1));
        breaker.admit().unwrap();
        breaker.record_failure();
        breaker.admit().unwrap();
        breaker.record_success();
        breaker.admit().unwrap();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_trial_success_closes_breaker() {
        let breaker = CircuitBreaker::new("classifier", &config(1, 0, 1));
        breaker.admit().unwrap();
        breaker.record_failure();
        assert!(breaker.is_open());

        // open_secs is 0 so the cooldown has already elapsed.
        breaker.admit().unwrap();
        breaker.record_success();
        assert!(!breaker.is_open());
        breaker.admit().unwrap();
    }

    #[test]
    fn half_open_trial_failure_reopens_breaker() {
        let breaker = CircuitBreaker::new("classifier", &config(1, 0, 1));
        breaker.admit().unwrap();
        breaker.record_failure();
        breaker.admit().unwrap();
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}

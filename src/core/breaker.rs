//! Circuit breaker guarding the gateway.
//!
//! One breaker exists per gateway endpoint and is shared by every caller in
//! the process. State lives behind a mutex that is never held across an
//! await point.
//!
//! - Closed: every call is attempted; consecutive qualifying failures are counted
//! - Open: calls fail fast until the cool-down elapses
//! - HalfOpen: exactly one trial call is admitted; everyone else is rejected

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// Breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures that open the breaker (default: 5)
    pub failure_threshold: u32,

    /// Time spent Open before a trial call is admitted (default: 30s)
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Call rejected without touching the gateway
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is open, retry in {retry_in:?}")]
pub struct BreakerError {
    pub name: String,
    pub retry_in: Duration,
}

/// Point-in-time view for logging and health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,

    /// Times the breaker has opened
    pub trips: u64,

    /// Calls rejected while Open or during a trial
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trips: u64,
    rejected: u64,
}

/// Process-wide breaker for one gateway endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                trips: 0,
                rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked: every update is a
        // handful of field writes with no early exit.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to make a call.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`],
    /// [`BreakerPermit::failure`] or [`BreakerPermit::neutral`]. Dropping it
    /// unresolved frees a half-open trial slot without changing state.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, BreakerError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    inner.rejected += 1;
                    Err(BreakerError {
                        name: self.name.clone(),
                        retry_in: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Err(BreakerError {
                        name: self.name.clone(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    debug!(breaker = %self.name, "Admitting replacement trial call");
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Current state as stored (an Open breaker past its cool-down still
    /// reports Open until the next call arrives)
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            rejected: inner.rejected,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            info!(breaker = %self.name, "Trial call succeeded, circuit closed");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
            warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trips += 1;
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Failure threshold reached, circuit opened"
                );
            }
        }
    }

    fn release_trial(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }
}

/// Admission to call the gateway once
#[must_use = "a permit should be resolved with success, failure or neutral"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The gateway answered
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    /// The gateway failed in a way that says something about its health
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }

    /// The outcome says nothing about gateway health (e.g. a rejected request)
    pub fn neutral(mut self) {
        self.resolved = true;
        self.breaker.release_trial(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release_trial(self.trial);
        }
    }
}

/// Background task that periodically logs breaker state.
///
/// Started once per breaker and stopped explicitly; dropping the monitor
/// also cancels the task.
pub struct BreakerMonitor {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BreakerMonitor {
    pub fn start(breaker: Arc<CircuitBreaker>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last = breaker.snapshot();
            info!(breaker = %last.name, state = ?last.state, "Breaker monitor started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = breaker.snapshot();
                        if snapshot.state != last.state || snapshot.trips != last.trips {
                            info!(
                                breaker = %snapshot.name,
                                state = ?snapshot.state,
                                trips = snapshot.trips,
                                rejected = snapshot.rejected,
                                "Breaker state changed"
                            );
                        } else {
                            debug!(
                                breaker = %snapshot.name,
                                state = ?snapshot.state,
                                failures = snapshot.consecutive_failures,
                                "Breaker state"
                            );
                        }
                        last = snapshot;
                    }
                }
            }

            debug!(breaker = %last.name, "Breaker monitor stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task and wait for it to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for BreakerMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[test]
    fn test_default_config() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, 60_000);
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
        assert_eq!(breaker.snapshot().trips, 1);
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = breaker(3, 60_000);
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_neutral_outcome_does_not_count() {
        let breaker = breaker(2, 60_000);
        breaker.try_acquire().unwrap().failure();
        for _ in 0..5 {
            breaker.try_acquire().unwrap().neutral();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, 20);
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        for _ in 0..10 {
            assert!(breaker.try_acquire().is_err());
        }

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = breaker(1, 20);
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().trips, 2);
        // Cool-down restarted
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let breaker = breaker(1, 20);
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));

        {
            let _trial = breaker.try_acquire().unwrap();
            assert!(breaker.try_acquire().is_err());
        }

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let replacement = breaker.try_acquire().unwrap();
        assert!(replacement.is_trial());
    }

    #[tokio::test]
    async fn test_monitor_start_and_stop() {
        let breaker = Arc::new(breaker(1, 20));
        let monitor = BreakerMonitor::start(Arc::clone(&breaker), Duration::from_millis(5));
        assert!(monitor.is_running());

        breaker.try_acquire().unwrap().failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), monitor.stop())
            .await
            .expect("monitor should stop promptly");
    }
}

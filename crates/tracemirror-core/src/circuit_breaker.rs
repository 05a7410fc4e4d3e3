//! Circuit breaker protecting calls to the remote trace-analytics provider.
//!
//! Provides a small state machine with cooldowns and status reporting.
//! Breakers are explicit, constructible objects passed by reference to
//! their consumers; there is no ambient registry.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown duration while the circuit is open.
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a new configuration.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    /// One trial call is allowed; while it is in flight other callers are
    /// refused exactly as if the circuit were open.
    HalfOpen { probing: bool },
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of circuit breaker status for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub probe_in_flight: bool,
}

/// Refusal returned when the breaker does not permit a call.
#[derive(Debug, Clone, Copy)]
pub struct Refusal {
    /// Milliseconds until a trial call will be permitted. Zero while a
    /// half-open probe is pending resolution.
    pub retry_after_ms: u64,
}

/// Circuit breaker state machine.
///
/// All methods take `&mut self`; share an instance between tasks through
/// [`SharedCircuitBreaker`], which serializes access with a single lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    /// Create a new circuit breaker from configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_name("unnamed", config)
    }

    /// Create a new circuit breaker with a stable name for log correlation.
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    /// Ask permission to run the guarded operation.
    ///
    /// On `Ok(())` the caller must report the outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure); in half-open state the
    /// permission is the single trial slot and failing to report it would
    /// wedge the breaker.
    pub fn try_acquire(&mut self) -> Result<(), Refusal> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen { probing: true };
                    info!(
                        circuit = %self.name,
                        "Circuit transitioned to half-open after cooldown"
                    );
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout - elapsed;
                    Err(Refusal {
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen { probing } => {
                if probing {
                    // A trial is already in flight; refuse until it resolves.
                    Err(Refusal { retry_after_ms: 0 })
                } else {
                    self.state = CircuitState::HalfOpen { probing: true };
                    Ok(())
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures = 0;
                self.state = CircuitState::Closed;
                info!(circuit = %self.name, "Circuit closed after successful probe");
            }
            CircuitState::Open { .. } => {
                // Ignore successes while open (no operations should run).
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        circuit = %self.name,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                // Failed probe: back to open, cooldown restarts from now.
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                warn!(circuit = %self.name, "Circuit re-opened after half-open failure");
            }
            CircuitState::Open { .. } => {
                // Already open; keep cooldown ticking.
            }
        }
    }

    /// Whether a call would currently be permitted, without consuming the
    /// half-open trial slot or advancing state.
    #[must_use]
    pub fn would_allow(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                opened_at.elapsed() >= self.config.recovery_timeout
            }
            CircuitState::HalfOpen { probing } => !probing,
        }
    }

    /// Return a status snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64;
        match self.state {
            CircuitState::Closed => CircuitBreakerStatus {
                state: CircuitStateKind::Closed,
                consecutive_failures: self.consecutive_failures,
                failure_threshold: self.config.failure_threshold,
                recovery_timeout_ms,
                open_for_ms: None,
                cooldown_remaining_ms: None,
                probe_in_flight: false,
            },
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                let remaining = self.config.recovery_timeout.checked_sub(elapsed);
                CircuitBreakerStatus {
                    state: CircuitStateKind::Open,
                    consecutive_failures: self.consecutive_failures,
                    failure_threshold: self.config.failure_threshold,
                    recovery_timeout_ms,
                    open_for_ms: Some(elapsed.as_millis() as u64),
                    cooldown_remaining_ms: remaining.map(|d| d.as_millis() as u64),
                    probe_in_flight: false,
                }
            }
            CircuitState::HalfOpen { probing } => CircuitBreakerStatus {
                state: CircuitStateKind::HalfOpen,
                consecutive_failures: self.consecutive_failures,
                failure_threshold: self.config.failure_threshold,
                recovery_timeout_ms,
                open_for_ms: None,
                cooldown_remaining_ms: None,
                probe_in_flight: probing,
            },
        }
    }
}

/// Cloneable handle to a breaker shared between the scheduler and the
/// aggregator's direct-read path.
///
/// The lock is held only around state transitions; callers release it
/// before awaiting the guarded I/O and re-acquire it to record the
/// outcome.
#[derive(Debug, Clone)]
pub struct SharedCircuitBreaker {
    inner: Arc<Mutex<CircuitBreaker>>,
}

impl SharedCircuitBreaker {
    /// Wrap a breaker for shared use.
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(breaker)),
        }
    }

    /// Ask permission to run the guarded operation.
    pub fn try_acquire(&self) -> Result<(), Refusal> {
        self.lock().try_acquire()
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        self.lock().record_success();
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.lock().record_failure();
    }

    /// Whether a call would currently be permitted.
    #[must_use]
    pub fn would_allow(&self) -> bool {
        self.lock().would_allow()
    }

    /// Status snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        self.lock().status()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_after_threshold() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(2, Duration::from_secs(10)));

        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert!(matches!(breaker.status().state, CircuitStateKind::Closed));

        breaker.record_failure();
        let status = breaker.status();
        assert!(matches!(status.state, CircuitStateKind::Open));
        assert!(status.cooldown_remaining_ms.is_some());
    }

    #[test]
    fn open_circuit_refuses_with_retry_after() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_secs(10)));
        breaker.record_failure();

        let refusal = breaker.try_acquire().expect_err("circuit is open");
        assert!(refusal.retry_after_ms > 0);
        assert!(refusal.retry_after_ms <= 10_000);
    }

    #[test]
    fn half_open_closes_on_success() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(0)));

        breaker.record_failure();
        // Cooldown is zero, so acquisition transitions to half-open.
        assert!(breaker.try_acquire().is_ok());
        assert!(matches!(breaker.status().state, CircuitStateKind::HalfOpen));

        breaker.record_success();
        let status = breaker.status();
        assert!(matches!(status.state, CircuitStateKind::Closed));
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_cooldown() {
        // Zero cooldown so try_acquire transitions straight to half-open.
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(0)));
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        let status = breaker.status();
        assert!(matches!(status.state, CircuitStateKind::Open));
        assert!(status.open_for_ms.is_some());
    }

    #[test]
    fn half_open_allows_exactly_one_trial() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(1, Duration::from_millis(0)));
        breaker.record_failure();

        assert!(breaker.try_acquire().is_ok());
        let refusal = breaker.try_acquire().expect_err("trial already in flight");
        assert_eq!(refusal.retry_after_ms, 0);

        breaker.record_success();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn shared_handle_serializes_transitions() {
        let shared = SharedCircuitBreaker::new(CircuitBreaker::with_name(
            "remote_provider",
            CircuitBreakerConfig::new(2, Duration::from_secs(30)),
        ));

        let clone = shared.clone();
        assert!(shared.try_acquire().is_ok());
        clone.record_failure();
        clone.record_failure();

        assert!(shared.try_acquire().is_err());
        assert!(!shared.would_allow());
        assert!(matches!(shared.status().state, CircuitStateKind::Open));
    }

    #[test]
    fn success_resets_failure_counter_while_closed() {
        let mut breaker =
            CircuitBreaker::new(CircuitBreakerConfig::new(3, Duration::from_secs(10)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.status().consecutive_failures, 0);

        breaker.record_failure();
        breaker.record_failure();
        assert!(matches!(breaker.status().state, CircuitStateKind::Closed));
    }
}

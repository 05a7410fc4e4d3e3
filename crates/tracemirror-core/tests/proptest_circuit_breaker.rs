//! Property-based tests for circuit_breaker module.
//!
//! Verifies the circuit breaker state machine invariants:
//! - Starts Closed, try_acquire succeeds
//! - N consecutive failures → Open (try_acquire refused)
//! - Success resets failure counter in Closed state
//! - HalfOpen: exactly one trial; success → Closed, failure → Open
//! - Config normalizes the failure threshold to >= 1
//! - Status fields match circuit state
//! - CircuitBreakerStatus serde roundtrip
//!
//! Note: Time-dependent transitions (Open → HalfOpen after cooldown) are
//! not tested here since proptest can't control Instant. Those are covered
//! by the unit tests in circuit_breaker.rs.

use proptest::prelude::*;
use std::time::Duration;

use tracemirror_core::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitStateKind,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_config() -> impl Strategy<Value = CircuitBreakerConfig> {
    (1u32..=10, 1u64..=60_000).prop_map(|(fail_t, cooldown_ms)| {
        CircuitBreakerConfig::new(fail_t, Duration::from_millis(cooldown_ms))
    })
}

// ────────────────────────────────────────────────────────────────────
// Initial state: starts Closed
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// New circuit breaker is always in Closed state.
    #[test]
    fn prop_starts_closed(config in arb_config()) {
        let mut cb = CircuitBreaker::new(config);
        prop_assert!(cb.try_acquire().is_ok(), "new circuit should allow operations");
        let status = cb.status();
        prop_assert_eq!(status.state, CircuitStateKind::Closed);
        prop_assert_eq!(status.consecutive_failures, 0);
    }
}

// ────────────────────────────────────────────────────────────────────
// Config normalization
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Config::new normalizes the failure threshold to be at least 1.
    #[test]
    fn prop_config_threshold_at_least_one(
        fail_t in 0u32..=10,
        cooldown_ms in 0u64..=60_000,
    ) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_millis(cooldown_ms));
        prop_assert!(config.failure_threshold >= 1);
    }
}

// ────────────────────────────────────────────────────────────────────
// Failure threshold → Open
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Exactly failure_threshold consecutive failures transitions to Open.
    #[test]
    fn prop_failures_open_circuit(fail_t in 1u32..=10) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_secs(3600));
        let mut cb = CircuitBreaker::new(config);

        for i in 0..fail_t {
            prop_assert_eq!(cb.status().state, CircuitStateKind::Closed, "still closed at {}", i);
            cb.record_failure();
        }
        prop_assert_eq!(cb.status().state, CircuitStateKind::Open);
        prop_assert!(cb.try_acquire().is_err(), "open circuit refuses calls");
    }

    /// One failure short of the threshold never opens the circuit.
    #[test]
    fn prop_below_threshold_stays_closed(fail_t in 2u32..=10) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_secs(3600));
        let mut cb = CircuitBreaker::new(config);

        for _ in 0..(fail_t - 1) {
            cb.record_failure();
        }
        prop_assert_eq!(cb.status().state, CircuitStateKind::Closed);
        prop_assert!(cb.try_acquire().is_ok());
    }

    /// A success anywhere in the run resets the consecutive counter.
    #[test]
    fn prop_success_resets_counter(
        fail_t in 2u32..=10,
        failures_before in 1u32..=9,
    ) {
        let failures_before = failures_before.min(fail_t - 1);
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_secs(3600));
        let mut cb = CircuitBreaker::new(config);

        for _ in 0..failures_before {
            cb.record_failure();
        }
        cb.record_success();
        prop_assert_eq!(cb.status().consecutive_failures, 0);

        // The full threshold is required again after the reset.
        for _ in 0..(fail_t - 1) {
            cb.record_failure();
        }
        prop_assert_eq!(cb.status().state, CircuitStateKind::Closed);
    }
}

// ────────────────────────────────────────────────────────────────────
// Refusal carries cooldown information
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Refusals report a retry_after bounded by the configured cooldown.
    #[test]
    fn prop_refusal_retry_after_bounded(
        fail_t in 1u32..=5,
        cooldown_ms in 1_000u64..=60_000,
    ) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_millis(cooldown_ms));
        let mut cb = CircuitBreaker::new(config);
        for _ in 0..fail_t {
            cb.record_failure();
        }

        let refusal = cb.try_acquire().expect_err("circuit just opened");
        prop_assert!(refusal.retry_after_ms <= cooldown_ms);
    }
}

// ────────────────────────────────────────────────────────────────────
// Half-open: single trial semantics
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// With a zero cooldown, the first acquisition after opening is the
    /// single half-open trial; a second is refused until it resolves.
    #[test]
    fn prop_half_open_single_trial(fail_t in 1u32..=5) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_millis(0));
        let mut cb = CircuitBreaker::new(config);
        for _ in 0..fail_t {
            cb.record_failure();
        }

        prop_assert!(cb.try_acquire().is_ok(), "cooldown elapsed: trial allowed");
        prop_assert_eq!(cb.status().state, CircuitStateKind::HalfOpen);
        prop_assert!(cb.try_acquire().is_err(), "second trial refused while probing");

        cb.record_success();
        prop_assert_eq!(cb.status().state, CircuitStateKind::Closed);
        prop_assert_eq!(cb.status().consecutive_failures, 0);
    }

    /// A failed trial reopens the circuit.
    #[test]
    fn prop_half_open_failure_reopens(fail_t in 1u32..=5) {
        let config = CircuitBreakerConfig::new(fail_t, Duration::from_millis(0));
        let mut cb = CircuitBreaker::new(config);
        for _ in 0..fail_t {
            cb.record_failure();
        }

        prop_assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        prop_assert_eq!(cb.status().state, CircuitStateKind::Open);
    }
}

// ────────────────────────────────────────────────────────────────────
// Status serde
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Status snapshots roundtrip through JSON.
    #[test]
    fn prop_status_serde_roundtrip(config in arb_config(), failures in 0u32..=12) {
        let mut cb = CircuitBreaker::new(config);
        for _ in 0..failures {
            cb.record_failure();
        }
        let status = cb.status();
        let json = serde_json::to_string(&status).expect("serialize");
        let back: CircuitBreakerStatus = serde_json::from_str(&json).expect("deserialize");
        prop_assert_eq!(back.state, status.state);
        prop_assert_eq!(back.consecutive_failures, status.consecutive_failures);
        prop_assert_eq!(back.failure_threshold, status.failure_threshold);
    }
}

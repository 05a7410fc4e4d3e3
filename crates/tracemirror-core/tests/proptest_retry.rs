//! Property-based tests for the retry module.
//!
//! Verifies backoff arithmetic invariants:
//! - Delays are monotonically non-decreasing without jitter
//! - Delays never exceed max_delay plus jitter headroom
//! - Jittered delays stay within ±jitter_percent of the base
//! - Policy normalization (factor >= 1, attempts >= 1)

use proptest::prelude::*;
use std::time::Duration;

use tracemirror_core::retry::RetryPolicy;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_policy_no_jitter() -> impl Strategy<Value = RetryPolicy> {
    (1u64..=1_000, 1u64..=60_000, 1.0f64..=4.0, 1u32..=10).prop_map(
        |(initial_ms, max_ms, factor, attempts)| {
            RetryPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(initial_ms.max(max_ms)),
                factor,
                0.0,
                attempts,
            )
        },
    )
}

// ────────────────────────────────────────────────────────────────────
// Monotonicity and capping
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Without jitter, delays never decrease as the attempt count grows.
    #[test]
    fn prop_delays_monotonic(policy in arb_policy_no_jitter()) {
        let mut last = Duration::ZERO;
        for attempt in 0..12 {
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay >= last, "attempt {} regressed: {:?} < {:?}", attempt, delay, last);
            last = delay;
        }
    }

    /// Without jitter, no delay exceeds the configured maximum.
    #[test]
    fn prop_delays_capped(policy in arb_policy_no_jitter()) {
        for attempt in 0..64 {
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= policy.max_delay);
        }
    }

    /// The first delay equals the initial delay when the factor applies
    /// from the second attempt on.
    #[test]
    fn prop_first_delay_is_initial(policy in arb_policy_no_jitter()) {
        prop_assert_eq!(policy.delay_for_attempt(0), policy.initial_delay.min(policy.max_delay));
    }
}

// ────────────────────────────────────────────────────────────────────
// Jitter bounds
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Jittered delays stay within ±jitter_percent of the unjittered base.
    #[test]
    fn prop_jitter_bounded(
        initial_ms in 100u64..=5_000,
        jitter in 0.0f64..=0.5,
    ) {
        let policy = RetryPolicy::new(
            Duration::from_millis(initial_ms),
            Duration::from_secs(3600),
            2.0,
            jitter,
            3,
        );
        let base = initial_ms as f64;
        let lo = (base * (1.0 - jitter)).floor() as u64;
        let hi = (base * (1.0 + jitter)).ceil() as u64;

        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0).as_millis() as u64;
            prop_assert!(delay >= lo, "delay {} below jitter floor {}", delay, lo);
            prop_assert!(delay <= hi, "delay {} above jitter ceiling {}", delay, hi);
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Normalization
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Degenerate inputs normalize to a usable policy.
    #[test]
    fn prop_policy_normalizes(
        factor in -3.0f64..=0.99,
        attempts in 0u32..=0,
        jitter in 1.1f64..=5.0,
    ) {
        let policy = RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            factor,
            jitter,
            attempts,
        );
        prop_assert!(policy.backoff_factor >= 1.0);
        prop_assert!(policy.max_attempts >= 1);
        prop_assert!(policy.jitter_percent <= 1.0);
    }
}

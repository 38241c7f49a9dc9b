//! Retry and backoff policy for failed step attempts.
//!
//! Stateless: every decision is a pure function of the effective policy and
//! how many retries have already happened.

use std::time::Duration;

use stepwise_types::workflow::{BackoffStrategy, RetryPolicy, StepDefinition};

/// Delay before retry number `attempt` (1 = first retry), in milliseconds.
///
/// - `fixed` → `initial`
/// - `linear` → `min(initial * attempt, max)`
/// - `exponential` → `min(initial * 2^(attempt-1), max)`
///
/// Arithmetic saturates instead of overflowing. A `max` below `initial`
/// caps every strategy at `max`.
pub fn next_delay(attempt: u32, strategy: BackoffStrategy, initial_ms: u64, max_ms: u64) -> u64 {
    let attempt = attempt.max(1);
    let raw = match strategy {
        BackoffStrategy::Fixed => initial_ms,
        BackoffStrategy::Linear => initial_ms.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let shift = (attempt - 1).min(63);
            initial_ms.saturating_mul(1u64 << shift)
        }
    };
    raw.min(max_ms)
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then reattempt.
    RetryAfter(Duration),
    /// Retries are exhausted.
    GiveUp,
}

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Merge the workflow's retry defaults with a step's overrides.
    pub fn effective_policy(defaults: &RetryPolicy, step: &StepDefinition) -> RetryPolicy {
        let eh = &step.error_handling;
        RetryPolicy {
            max_retries: eh.max_retries.unwrap_or(defaults.max_retries),
            strategy: eh.backoff.unwrap_or(defaults.strategy),
            initial_delay_ms: eh.retry_delay_ms.unwrap_or(defaults.initial_delay_ms),
            max_delay_ms: eh.max_delay_ms.unwrap_or(defaults.max_delay_ms),
        }
    }

    /// Decide whether to retry after `retries_done` retries have already run.
    pub fn decide(policy: &RetryPolicy, retries_done: u32) -> RetryDecision {
        if retries_done >= policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = next_delay(
            retries_done + 1,
            policy.strategy,
            policy.initial_delay_ms,
            policy.max_delay_ms,
        );
        RetryDecision::RetryAfter(Duration::from_millis(delay))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn policy(max_retries: u32, strategy: BackoffStrategy, initial: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            strategy,
            initial_delay_ms: initial,
            max_delay_ms: max,
        }
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        for attempt in 1..6 {
            assert_eq!(next_delay(attempt, BackoffStrategy::Fixed, 500, 10_000), 500);
        }
    }

    #[test]
    fn test_linear_delay_grows_and_caps() {
        assert_eq!(next_delay(1, BackoffStrategy::Linear, 1000, 2500), 1000);
        assert_eq!(next_delay(2, BackoffStrategy::Linear, 1000, 2500), 2000);
        assert_eq!(next_delay(3, BackoffStrategy::Linear, 1000, 2500), 2500);
    }

    #[test]
    fn test_exponential_delay_sequence() {
        let delays: Vec<u64> = (1..=5)
            .map(|a| next_delay(a, BackoffStrategy::Exponential, 1000, 5000))
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_exponential_saturates_on_huge_attempts() {
        assert_eq!(
            next_delay(200, BackoffStrategy::Exponential, u64::MAX / 2, u64::MAX),
            u64::MAX
        );
    }

    #[test]
    fn test_decide_two_retries_then_give_up() {
        let p = policy(2, BackoffStrategy::Exponential, 1000, 5000);
        assert_eq!(
            RetryHandler::decide(&p, 0),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
        assert_eq!(
            RetryHandler::decide(&p, 1),
            RetryDecision::RetryAfter(Duration::from_millis(2000))
        );
        assert_eq!(RetryHandler::decide(&p, 2), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let p = policy(0, BackoffStrategy::Fixed, 10, 10);
        assert_eq!(RetryHandler::decide(&p, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_effective_policy_prefers_step_overrides() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "s",
            "error_handling": { "on_error": "retry", "max_retries": 5, "backoff": "linear" },
            "config": { "type": "action", "action_type": "noop" }
        }))
        .unwrap();
        let merged = RetryHandler::effective_policy(&RetryPolicy::default(), &step);
        assert_eq!(merged.max_retries, 5);
        assert_eq!(merged.strategy, BackoffStrategy::Linear);
        assert_eq!(merged.initial_delay_ms, 1000);
        assert_eq!(merged.max_delay_ms, 60_000);
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            attempt in 1u32..64,
            initial in 0u64..100_000,
            max in 0u64..10_000_000,
            exponential in any::<bool>(),
        ) {
            let strategy = if exponential { BackoffStrategy::Exponential } else { BackoffStrategy::Linear };
            let current = next_delay(attempt, strategy, initial, max);
            let next = next_delay(attempt + 1, strategy, initial, max);
            prop_assert!(next >= current);
            prop_assert!(next <= max);
        }

        #[test]
        fn prop_decide_never_exceeds_max_retries(max_retries in 0u32..20, done in 0u32..40) {
            let p = policy(max_retries, BackoffStrategy::Fixed, 1, 1);
            let decision = RetryHandler::decide(&p, done);
            prop_assert_eq!(decision == RetryDecision::GiveUp, done >= max_retries);
        }
    }
}

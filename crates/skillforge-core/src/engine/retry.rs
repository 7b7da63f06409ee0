//! Retry policy for operation steps.
//!
//! Stateless: the policy is derived from the step definition and the caller
//! tracks the attempt number. `retry_count = N` allows `N + 1` attempts with
//! a fixed delay in between. Only the final failure is reported.

use std::time::Duration;

use skillforge_types::skill::StepDefinition;

/// Attempts and delay of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    pub fn for_step(step: &StepDefinition) -> Self {
        Self {
            max_attempts: step.retry_count.saturating_add(1),
            delay: Duration::from_millis(step.retry_delay_ms),
        }
    }

    /// Whether another attempt follows attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether waiting `delay` still fits in `remaining`.
    pub fn delay_fits(&self, remaining: Option<Duration>) -> bool {
        remaining.is_none_or(|r| self.delay < r)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillforge_types::skill::StepKind;

    fn step(retry_count: u32, retry_delay_ms: u64) -> StepDefinition {
        StepDefinition {
            id: "s".to_string(),
            name: "S".to_string(),
            sequence: 10,
            kind: StepKind::Action {
                action: "noop".to_string(),
                params_template: None,
            },
            output_variable: None,
            output_transform: None,
            is_critical: true,
            retry_count,
            retry_delay_ms,
            rollback_on_failure: false,
        }
    }

    #[test]
    fn test_no_retry_by_default() {
        let policy = RetryPolicy::for_step(&step(0, 0));
        assert_eq!(policy, RetryPolicy::NONE);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_retry_count_allows_n_plus_one_attempts() {
        let policy = RetryPolicy::for_step(&step(2, 250));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_fits_budget() {
        let policy = RetryPolicy::for_step(&step(1, 500));
        assert!(policy.delay_fits(None));
        assert!(policy.delay_fits(Some(Duration::from_secs(1))));
        assert!(!policy.delay_fits(Some(Duration::from_millis(100))));
    }
}

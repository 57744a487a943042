use std::time::Duration;

use crate::broker::subscription::{BackoffFunction, RetryPolicy};

/// Tiered backoff schedule for one (message, subscription) pair.
///
/// Delays are drawn from three pools in order: zero-delay retries, then
/// minimum-delay retries, then maximum-delay retries. Only once all three
/// are drained does the schedule fall back to the computed linear or
/// exponential curve between `min_delay` and `max_delay`. The near-immediate
/// pools absorb brief transient failures before escalating to longer waits.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    no_delay_left: u32,
    min_delay_left: u32,
    max_delay_left: u32,
    /// 0-based index into the computed portion of the schedule.
    computed_step: u32,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            no_delay_left: policy.num_no_delay_retries,
            min_delay_left: policy.num_min_delay_retries,
            max_delay_left: policy.num_max_delay_retries,
            computed_step: 0,
            policy,
        }
    }

    /// Number of computed-backoff slots left after the pools.
    fn computed_slots(&self) -> u32 {
        self.policy.num_retries.saturating_sub(
            self.policy.num_no_delay_retries
                + self.policy.num_min_delay_retries
                + self.policy.num_max_delay_retries,
        )
    }

    /// Returns the delay to wait before the next retry and advances the
    /// schedule. Consecutive computed delays are non-decreasing.
    pub fn next_delay(&mut self) -> Duration {
        if self.no_delay_left > 0 {
            self.no_delay_left -= 1;
            return Duration::ZERO;
        }
        if self.min_delay_left > 0 {
            self.min_delay_left -= 1;
            return self.policy.min_delay();
        }
        if self.max_delay_left > 0 {
            self.max_delay_left -= 1;
            return self.policy.max_delay();
        }

        let delay = self.computed_delay(self.computed_step);
        self.computed_step += 1;
        delay
    }

    fn computed_delay(&self, step: u32) -> Duration {
        let min = self.policy.min_delay_ms;
        let max = self.policy.max_delay_ms.max(min);

        let ms = match self.policy.backoff_function {
            BackoffFunction::Linear => {
                // Evenly spaced steps from min to max across the computed slots.
                let slots = self.computed_slots().max(1);
                let span = max - min;
                min + span.saturating_mul(u64::from(step.min(slots - 1) + 1)) / u64::from(slots)
            }
            BackoffFunction::Exponential => {
                let factor = 1u64.checked_shl(step).unwrap_or(u64::MAX);
                min.saturating_mul(factor).min(max)
            }
        };

        Duration::from_millis(ms)
    }
}

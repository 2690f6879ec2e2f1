use crate::config::ReconnectPolicy;
use std::time::Duration;

/// Doubling retry delay, capped at the policy maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current: policy.initial_delay,
            policy,
            attempt: 0,
        }
    }

    /// Number of retries handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;
        let delay = self.current;
        self.current = next_backoff(self.current, self.policy.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.policy.initial_delay;
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_add(current);
    if next > max {
        max
    } else {
        next
    }
}

use rand::Rng;
use std::time::Duration;

const MAX_JITTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

/// Attempt counter and exponential backoff for one supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    policy: RetryPolicy,
    attempt_count: u32,
    backoff: Duration,
}

impl ConnectionAttempt {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
            backoff: policy.base,
        }
    }

    /// Counts a new connection attempt and returns its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.backoff = self.policy.base;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempt_count >= max)
    }

    /// Delay before the next attempt after a failure: the current backoff plus
    /// jitter in `[0, min(5s, backoff))`. Doubles the backoff up to the
    /// ceiling. Returns `None` once the attempt budget is spent.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let jitter_bound = self.backoff.min(MAX_JITTER);
        let jitter = if jitter_bound.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(rng.gen_range(0.0..jitter_bound.as_secs_f64()))
        };
        let delay = self.backoff + jitter;
        self.backoff = (self.backoff * 2).min(self.policy.max);
        Some(delay)
    }
}

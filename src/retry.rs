use std::time::Duration;

/// Exponential backoff parameters: `delay(n) = min(base * multiplier^(n-1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based). Attempt 0 means "no wait".
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = u128::from(self.multiplier.max(1)).checked_pow(attempt - 1);
        match factor.and_then(|f| self.base.as_nanos().checked_mul(f)) {
            Some(nanos) if nanos < self.cap.as_nanos() => {
                // Below the cap, so it fits in u64 whenever the cap does.
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
            _ => self.cap,
        }
    }
}

/// Stateful counterpart of [`BackoffPolicy`], optionally bounded by a retry limit.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    max_retries: Option<u32>,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Backoff that gives up after `max_retries` retries.
    pub fn new(policy: BackoffPolicy, max_retries: u32) -> Self {
        ExponentialBackoff {
            policy,
            max_retries: Some(max_retries),
            current_attempt: 0,
        }
    }

    /// Backoff that never gives up; delays stay at the cap once reached.
    pub fn unbounded(policy: BackoffPolicy) -> Self {
        ExponentialBackoff {
            policy,
            max_retries: None,
            current_attempt: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt, or `None` when the
    /// retry limit is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return None;
            }
        }
        self.current_attempt = self.current_attempt.saturating_add(1);
        Some(self.policy.delay(self.current_attempt))
    }

    /// Number of retries handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_retries, Some(max) if self.current_attempt >= max)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

use std::time::Duration;

/// Base delay for the first reconnect attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Cap applied to the exponential part before jitter is added.
pub const RECONNECT_EXP_CAP: Duration = Duration::from_secs(15);
/// Hard cap on the final delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Upper bound (exclusive) of the random jitter added to each delay.
pub const RECONNECT_MAX_JITTER: Duration = Duration::from_millis(250);

/// Computes the delay before reconnect attempt number `attempt` (1-based).
///
/// `min(30s, min(15s, 500ms * 2^(attempt-1)) + jitter)`. Attempt 0 is treated as 1.
pub fn reconnect_delay(attempt: u32, jitter: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base_ms = RECONNECT_BASE_DELAY.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(1u64 << exponent)
        .min(RECONNECT_EXP_CAP.as_millis() as u64);
    let jitter = jitter.min(RECONNECT_MAX_JITTER);
    (Duration::from_millis(exp_ms) + jitter).min(RECONNECT_MAX_DELAY)
}

/// Attempt counter for the reconnect loop.
#[derive(Debug, Default, Clone)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records one more unintended closure and returns the delay to wait.
    pub fn next_delay(&mut self, jitter: Duration) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        reconnect_delay(self.attempt, jitter)
    }

    /// Called after a successful registration.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

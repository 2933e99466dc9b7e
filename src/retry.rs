//! Bounded exponential backoff shared by the HTTP clients.
//!
//! Each client keeps its own request loop; this module only answers "may I
//! try again" and "how long do I wait".

use std::time::Duration;

use reqwest::StatusCode;

/// Doubling never grows past `base << MAX_SHIFT`.
const MAX_SHIFT: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    max_attempts: u32,
    base: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::from_millis(base_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is the number of attempts already made.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before attempt number `attempt + 1` (1-based `attempt`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_SHIFT);
        self.base * (1u32 << shift)
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

/// Rate limiting and server errors are worth another attempt.
pub fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

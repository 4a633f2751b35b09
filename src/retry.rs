use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::HarvestError;

/// Outcome of one failed remote call, as seen by [`RetryPolicy`].
#[derive(Debug)]
pub enum RemoteFailure {
    /// The archive job has not finished yet; worth asking again later.
    Transient(String),
    /// Anything else. Never retried.
    Terminal(HarvestError),
}

impl From<HarvestError> for RemoteFailure {
    fn from(value: HarvestError) -> Self {
        RemoteFailure::Terminal(value)
    }
}

static STILL_RUNNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(still\s+(running|processing)|in\s+progress|queued|accepted)\b")
        .expect("static pattern")
});

/// The only place archive message text is interpreted.
pub fn classify_message(message: &str) -> RemoteFailure {
    if STILL_RUNNING.is_match(message) {
        RemoteFailure::Transient(message.to_string())
    } else {
        RemoteFailure::Terminal(HarvestError::ArchiveRejected(message.to_string()))
    }
}

/// Bounded retry with exponential backoff for the transient case only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    multiplier: Duration,
    min_wait: Duration,
    max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        multiplier: Duration,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            multiplier,
            min_wait,
            max_wait: max_wait.max(min_wait),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the `attempt`-th failure (1-based): `multiplier * 2^(attempt - 1)`
    /// clamped to `[min_wait, max_wait]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.multiplier.checked_mul(factor))
            .unwrap_or(self.max_wait);
        raw.clamp(self.min_wait, self.max_wait)
    }

    /// Calls `call` with the 1-based attempt number until it succeeds, fails
    /// terminally, or the attempt budget is spent.
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T, HarvestError>
    where
        F: FnMut(u32) -> Result<T, RemoteFailure>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(RemoteFailure::Terminal(err)) => return Err(err),
                Err(RemoteFailure::Transient(reason)) => {
                    if attempt >= self.max_attempts {
                        return Err(HarvestError::RetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last: reason,
                        });
                    }
                    let wait = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        reason = %reason,
                        "archive job not ready; retrying"
                    );
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

//! Bounded retry with escalating delay for fallible async operations.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;
use tokio::time::sleep;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Retry budget for a single logical operation.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Builder)]
pub struct RetryOptions {
    /// Total attempts, including the first
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Delay before the first retry; later delays grow quadratically
    #[builder(default = DEFAULT_BASE_DELAY)]
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Quadratically escalating, bounded backoff: the delay before retry `n`
/// is `base_delay × n²`, and no delay is produced once the attempt budget
/// is exhausted.
#[derive(Clone, Debug)]
pub struct QuadraticBackoff {
    base_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl QuadraticBackoff {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self {
            base_delay: options.base_delay,
            max_attempts: options.max_attempts,
            attempt: 0,
        }
    }
}

impl Backoff for QuadraticBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        // attempt counts completed tries; n attempts need n - 1 delays.
        if self.attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }

        self.attempt += 1;
        Some(self.base_delay * self.attempt * self.attempt)
    }
}

/// Drive `operation` until it succeeds or `backoff` stops producing delays.
///
/// The last error is returned once the budget is exhausted. Works with any
/// [`Backoff`] implementation, so reconnection loops can feed their
/// exponential policy through the same driver.
pub async fn retry<B, T, E, F, Fut>(mut backoff: B, mut operation: F) -> Result<T, E>
where
    B: Backoff,
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1_u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => match backoff.next_backoff() {
                Some(delay) => {
                    tracing::debug!(%error, attempt, ?delay, "operation failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::debug!(%error, attempt, "operation failed, retry budget exhausted");
                    return Err(error);
                }
            },
        }
    }
}

/// An outbound send that kept failing until the retry budget ran out.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct SendExhausted {
    pub attempts: u32,
}

impl fmt::Display for SendExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed after {} attempts", self.attempts)
    }
}

impl StdError for SendExhausted {}

impl From<SendExhausted> for crate::error::Error {
    fn from(e: SendExhausted) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Send, e)
    }
}

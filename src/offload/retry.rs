use crate::error::ErmesError;

use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter and a hard cap on attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 150,
            max_delay_ms: 1200,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Runs `op` until it succeeds, fails with an error `retryable` rejects, or the
    /// attempts run out. The last error is returned in the latter case.
    pub async fn run<T, F, Fut, R>(&self, mut op: F, retryable: R) -> Result<T, ErmesError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ErmesError>>,
        R: Fn(&ErmesError) -> bool,
    {
        let mut delay_ms = self.initial_delay_ms;

        for attempt in 0..self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt + 1 < self.max_attempts => {
                    tracing::debug!(
                        "Attempt {}/{} failed ({}), retrying in {}ms",
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay_ms
                    );
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.max_delay_ms);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ErmesError::RetriesExhausted(self.max_attempts))
    }
}

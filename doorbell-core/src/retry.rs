use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`, plus random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    pub fn from_millis(attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self::new(
            attempts,
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        )
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let mut delay = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }
        delay
    }
}

/// Runs `operation` until it succeeds, fails permanently, or exhausts the backoff.
pub async fn retry_async<F, Fut, T, E>(backoff: &Backoff, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let attempts = backoff.attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() || attempt + 1 >= attempts => return Err(err),
            Err(err) => {
                let delay = backoff.compute_delay(attempt);
                warn!(attempt = attempt + 1, wait = ?delay, stage = label, error = %err, "retrying operation");
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

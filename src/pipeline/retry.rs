use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How a failed attempt should be treated by [`RetryPolicy::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    /// Upstream asked us to slow down; waits `rate_limit_factor` times longer.
    RateLimited,
    Permanent,
}

pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// base, 2*base, 4*base, ...
    Exponential,
    /// base, 2*base, 3*base, ...
    Linear,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub rate_limit_factor: u32,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
            rate_limit_factor: 2,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::MAX,
            backoff: Backoff::Linear,
            rate_limit_factor: 2,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, class: RetryClass) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
        };
        let delay = match class {
            RetryClass::RateLimited => delay.saturating_mul(self.rate_limit_factor),
            _ => delay,
        };
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let class = e.retry_class();
                    if class == RetryClass::Permanent {
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        tracing::warn!(label, attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt, class);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

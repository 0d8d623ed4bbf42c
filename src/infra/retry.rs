//! Bounded retries for storage calls
//!
//! The checkpoint flush loop runs its writes through [`Retry`]. A lost flush
//! only lengthens the next catch-up, so the budget is small and only errors
//! reporting [`ProjectionError::is_transient`] are retried.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

use super::ProjectionError;

/// Retry budget and backoff shape
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub cap: Duration,
    pub factor: f64,
    /// Fraction of each delay randomized in both directions, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Millisecond delays without jitter, for in-memory stores and tests
    pub fn fast() -> Self {
        Self {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(20),
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Database-backed checkpoint stores
    pub fn storage() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_millis(50),
            cap: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `attempt`, counting from zero
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nominal = (self.base.as_secs_f64() * self.factor.powi(exponent))
            .min(self.cap.as_secs_f64());
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let spread = nominal * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((nominal + offset).max(0.0))
    }

    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            attempt: 0,
        }
    }
}

/// Delays between attempts; exhausted once the retry budget is spent
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    attempt: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

/// Outcome of [`Retry::run_transient`]
#[derive(Debug)]
pub struct RetryResult<T> {
    pub result: Result<T, ProjectionError>,
    /// Calls made, including the first
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, ProjectionError> {
        self.result
    }
}

pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Call `operation` until it succeeds, fails permanently, or the budget
    /// runs out
    pub async fn run_transient<F, Fut, T>(&self, context: &str, operation: F) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProjectionError>>,
    {
        let started = Instant::now();
        let mut delays = self.config.backoff();
        let mut attempts = 1;

        let result = loop {
            let err = match operation().await {
                Ok(value) => break Ok(value),
                Err(e) if !e.is_transient() => break Err(e),
                Err(e) => e,
            };
            let Some(delay) = delays.next() else {
                break Err(err);
            };
            tracing::debug!(
                context,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;
        };

        match &result {
            Ok(_) if attempts > 1 => {
                tracing::info!(context, attempts, "Succeeded after retries")
            }
            Err(e) => tracing::warn!(context, attempts, error = %e, "Giving up"),
            Ok(_) => {}
        }

        RetryResult {
            result,
            attempts,
            total_duration: started.elapsed(),
        }
    }
}

//! Exponential backoff with jitter for batch delivery.
//!
//! The delay before retry `n` (0-based) is
//! `min(max_wait, initial_wait * multiplier^n)`, moved by up to ±25% and never
//! shorter than `initial_wait`.

use crate::config::types::UpstreamConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const JITTER_FRACTION: f64 = 0.25;

/// Classifies an error as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Permanent(E),

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// The error of the final attempt, if one was made.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl From<&UpstreamConfig> for RetryPolicy {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_wait: config.initial_wait,
            max_wait: config.max_wait,
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Fast-failing policy for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(40),
            multiplier: 2.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after failed attempt `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_wait.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_wait.as_secs_f64() {
            return self.max_wait;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay with jitter, where `unit` in `[-1, 1]` picks the point inside the ±25% band.
    pub fn backoff_with(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jittered = base * (1.0 + JITTER_FRACTION * unit.clamp(-1.0, 1.0));
        Duration::from_secs_f64(jittered.max(self.initial_wait.as_secs_f64()))
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.backoff_with(attempt, unit)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires during a backoff wait.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(RetryError::Permanent(e)),
                Err(e) => e,
            };

            if attempt >= self.max_retries {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: error,
                });
            }

            let wait = self.backoff(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = self.max_attempts(),
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: attempt + 1,
                        last: Some(error),
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

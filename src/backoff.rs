//! Jittered exponential backoff used by store calls, fetch loops and rebalance passes.

use std::ops::ControlFlow;
use std::time::Duration;

use rand::prelude::*;
use thiserror::Error;
use tracing::info;

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,

    /// Give up once the accumulated backoff reaches this duration.
    pub deadline: Option<Duration>,

    /// Give up after this many backoffs.
    pub max_attempts: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            base: 3.,
            deadline: None,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Checks that the config describes a growing, non-empty backoff range.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.init_backoff.is_zero() {
            return Err("init_backoff must not be zero");
        }
        if self.max_backoff < self.init_backoff {
            return Err("max_backoff must not be below init_backoff");
        }
        if !self.base.is_finite() || self.base <= 1.0 {
            return Err("base must be a finite number above 1");
        }

        Ok(())
    }
}

type SourceError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Retry exceeded deadline of {deadline:?}. Source: {source}")]
    DeadlineExceeded {
        deadline: Duration,
        source: SourceError,
    },

    #[error("Retry gave up after {attempts} attempts. Source: {source}")]
    AttemptsExhausted { attempts: usize, source: SourceError },
}

pub type BackoffResult<T> = Result<T, BackoffError>;

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff interval
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    total: f64,
    attempts: usize,
    deadline: Option<f64>,
    max_attempts: Option<usize>,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Uses [`rand::thread_rng()`] if no rng is provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            total: 0.0,
            attempts: 0,
            deadline: config.deadline.map(|d| d.as_secs_f64()),
            max_attempts: config.max_attempts,
            rng,
        }
    }

    /// Number of backoffs handed out so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Returns the next backoff duration to wait for, or `None` once the deadline or the
    /// attempt ceiling is reached.
    pub fn next(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }

        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = if range.is_empty() {
            range.start
        } else {
            match self.rng.as_mut() {
                Some(rng) => rng.gen_range(range),
                None => thread_rng().gen_range(range),
            }
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        self.total += next_backoff;
        self.attempts += 1;
        let res = std::mem::replace(&mut self.next_backoff_secs, next_backoff);

        if let Some(deadline) = self.deadline {
            if self.total >= deadline {
                return None;
            }
        }

        Some(Duration::from_secs_f64(res))
    }

    /// Perform an async operation that retries with a backoff
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        request_name: &str,
        do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (Fn() -> F1) + Send + Sync,
        F1: std::future::Future<Output = ControlFlow<B, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            let e = match do_stuff().await {
                ControlFlow::Break(r) => break Ok(r),
                ControlFlow::Continue(e) => e,
            };

            let backoff = match self.next() {
                Some(backoff) => backoff,
                None => return Err(self.give_up(Box::new(e))),
            };

            info!(
                e=%e,
                request_name,
                backoff_secs = backoff.as_secs_f64(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn give_up(&self, source: SourceError) -> BackoffError {
        match self.deadline {
            Some(deadline) if self.max_attempts.map_or(true, |max| self.attempts < max) => {
                BackoffError::DeadlineExceeded {
                    deadline: Duration::from_secs_f64(deadline),
                    source,
                }
            }
            _ => BackoffError::AttemptsExhausted {
                attempts: self.attempts,
                source,
            },
        }
    }
}

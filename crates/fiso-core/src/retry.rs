//! Exponential-backoff retry executor with jitter (§4.3).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Classified;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Fraction in [0, 1] applied as a uniform jitter window around the
    /// backoff delay.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            jitter_fraction: 0.1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,
    #[error(transparent)]
    Exhausted(#[from] RetryExhausted<E>),
}

#[derive(Debug, thiserror::Error)]
#[error("retry attempts exhausted")]
pub struct RetryExhausted<E>(pub E);

fn backoff_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .initial_interval
        .as_secs_f64()
        .mul_add(2f64.powi(attempt as i32), 0.0);
    let base = exp.min(config.max_interval.as_secs_f64());
    let jitter = config.jitter_fraction.clamp(0.0, 1.0);
    let factor = if jitter == 0.0 {
        1.0
    } else {
        rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
    };
    Duration::from_secs_f64((base * factor).max(0.0))
}

/// Executes `operation` up to `config.max_attempts` times. `operation`
/// signals non-retryable failure via [`Classified::Permanent`], in which
/// case the executor returns immediately without sleeping.
///
/// Honors `cancel`: if it resolves during the inter-attempt sleep, returns
/// `RetryError::Cancelled` without another invocation of `operation`.
pub async fn execute<F, Fut, E, C, CFut>(
    config: &RetryConfig,
    mut operation: F,
    mut cancelled: C,
) -> Result<(), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Classified<E>>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = ()>,
{
    let mut last_err = None;
    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(Classified::Permanent(e)) => return Err(RetryExhausted(e).into()),
            Err(Classified::Transient(e)) => {
                last_err = Some(e);
                if attempt + 1 >= config.max_attempts {
                    break;
                }
                let sleep = tokio::time::sleep(backoff_for_attempt(config, attempt));
                tokio::select! {
                    _ = sleep => {}
                    _ = cancelled() => return Err(RetryError::Cancelled),
                }
            }
        }
    }
    Err(RetryExhausted(last_err.expect("at least one attempt ran")).into())
}

/// Convenience wrapper for call sites with no cancellation source.
pub async fn execute_uncancellable<F, Fut, E>(
    config: &RetryConfig,
    operation: F,
) -> Result<(), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Classified<E>>>,
{
    execute(config, operation, || std::future::pending()).await
}

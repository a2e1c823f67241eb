//! Retry configuration and exponential backoff logic.
//!
//! This module provides the [`RetryConfig`] type and the [`retry_with_backoff`]
//! helper used by [`RpcNode`](crate::RpcNode) around the enqueue step of
//! `call`, `schedule_at` and `cancel`.
//!
//! # Retry Strategy
//!
//! - Only retries [`RpcError::TransportRetryable`](crate::RpcError::TransportRetryable)
//!   errors, i.e. failures where the broker never accepted the entry
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay`
//! - Logs each retry attempt at debug level

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration with exponential backoff.
///
/// # Example
///
/// ```
/// use stream_rpc::RetryConfig;
/// use std::time::Duration;
///
/// let retry_config = RetryConfig {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// 3 retries, doubling from 100 ms, capped at 5 s.
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// With `retry_config == None` the operation executes exactly once.
/// Non-retryable errors are returned immediately.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized retries
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        let details = match operation().await {
            Ok(result) => return Ok(result),
            Err(crate::RpcError::TransportRetryable(details)) => details,
            Err(err) => return Err(err),
        };

        attempt += 1;
        if attempt > retry_config.max_attempts {
            crate::log_debug!(
                "enqueue retry exhausted after {} attempts, last error: {details}",
                retry_config.max_attempts
            );
            return Err(crate::RpcError::TransportRetryable(details));
        }

        let jittered_delay = apply_jitter(current_delay);
        crate::log_debug!(
            "enqueue retry {attempt}/{}, waiting {jittered_delay:?} (error: {details})",
            retry_config.max_attempts
        );
        sleep(jittered_delay).await;

        let next_delay =
            Duration::from_secs_f64(current_delay.as_secs_f64() * retry_config.multiplier as f64);
        current_delay = next_delay.min(retry_config.max_delay);
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

//! Retry policy used around appliance RPCs.
//!
//! Two shapes are used in practice: the default exponential backoff for most
//! calls, and a fixed-interval policy for deletes, which also treat
//! "resource busy" as retryable since ZFS/ctl teardown races are common when
//! a dataset was only just unmounted on the node side.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{is_busy_text, is_network_retryable_text, ApplianceError};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Default policy for network/API calls: up to 3 attempts, 1s initial
    /// backoff doubling up to a 30s cap.
    pub const fn default_policy() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Deletion policy: fixed 5s interval, 12 attempts, roughly a minute of
    /// patience for a dataset to stop being busy.
    pub const fn deletion_policy() -> Self {
        Self {
            max_attempts: 12,
            initial_backoff: Duration::from_secs(5),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(5),
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1.0 {
            return self.initial_backoff;
        }
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Whether `err` should be retried under the default network/API policy.
pub fn is_retryable(err: &ApplianceError) -> bool {
    matches!(
        err,
        ApplianceError::NetworkRetryable(_) | ApplianceError::ApiRetryable(_)
    )
}

/// Whether `err` should be retried under the deletion policy: the default
/// set, plus anything reporting the dataset/resource as transiently busy.
pub fn is_deletion_retryable(err: &ApplianceError) -> bool {
    if is_retryable(err) {
        return true;
    }
    matches!(err, ApplianceError::BusyResource(_))
}

/// Re-classifies a raw wire message using both the network and busy-text
/// predicates, for call sites that need to decide retryability from a string
/// before it has been wrapped into an `ApplianceError`.
pub fn text_is_retryable(msg: &str, include_busy: bool) -> bool {
    let lower = msg.to_lowercase();
    is_network_retryable_text(&lower) || (include_busy && is_busy_text(&lower))
}

/// Runs `op`, retrying per `config` and `classify` until it succeeds, a
/// non-retryable error is returned, or attempts are exhausted. On exhaustion
/// the last error is wrapped in `ApplianceError::RetriesExhausted`.
pub async fn retry<T, F, Fut>(
    config: RetryConfig,
    classify: impl Fn(&ApplianceError) -> bool,
    mut op: F,
) -> Result<T, ApplianceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplianceError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= config.max_attempts || !classify(&err) {
                    if attempt >= config.max_attempts {
                        return Err(ApplianceError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    return Err(err);
                }
                let backoff = config.backoff_for_attempt(attempt - 1);
                warn!(attempt, ?backoff, error = %err, "retrying appliance operation");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Convenience wrapper for the common default-policy, network/API-retryable case.
pub async fn retry_default<T, F, Fut>(op: F) -> Result<T, ApplianceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplianceError>>,
{
    retry(RetryConfig::default_policy(), is_retryable, op).await
}

/// Convenience wrapper for deletion call sites.
pub async fn retry_deletion<T, F, Fut>(op: F) -> Result<T, ApplianceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplianceError>>,
{
    retry(RetryConfig::deletion_policy(), is_deletion_retryable, op).await
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = Cell::new(0);
        let result = retry_default(|| {
            let n = attempts.get() + 1;
            attempts.set(n);
            async move {
                if n < 3 {
                    Err(ApplianceError::NetworkRetryable("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_and_wraps_last_error() {
        let result: Result<(), _> = retry_default(|| async {
            Err(ApplianceError::NetworkRetryable("connection refused".into()))
        })
        .await;
        match result.unwrap_err() {
            ApplianceError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_returns_immediately() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = retry_default(|| {
            attempts.set(attempts.get() + 1);
            async { Err(ApplianceError::InvalidArgument("bad size".into())) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), ApplianceError::InvalidArgument(_)));
        assert_eq!(attempts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_policy_retries_busy() {
        let attempts = Cell::new(0);
        let result = retry_deletion(|| {
            let n = attempts.get() + 1;
            attempts.set(n);
            async move {
                if n < 2 {
                    Err(ApplianceError::BusyResource("dataset is busy".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 2);
    }
}

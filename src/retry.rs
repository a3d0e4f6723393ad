//! Exponential backoff for transient persistence and RPC failures.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::settings::RetrySettings;

/// Compute the delay before retry number `attempt` (0-based), with a
/// randomized multiplier in [1.0, 1.5) to spread synchronized retries.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let base = settings.initial_interval_ms as f64 * settings.backoff.powi(attempt as i32);
    let capped = base.min(settings.max_interval_ms as f64);
    let jitter = 1.0 + rand::random::<f64>() * 0.5;
    Duration::from_millis((capped * jitter).round() as u64)
}

/// Retry `op` while `is_retryable` approves the error, sleeping per the
/// backoff settings between attempts. Gives up when the policy's time
/// budget expires or `cancel` fires, returning the last error.
pub async fn retry<T, E, F, Fut>(
    settings: &RetrySettings,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let expiration = (settings.expiration_ms > 0)
        .then(|| Duration::from_millis(settings.expiration_ms));
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if cancel.is_cancelled() || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = backoff_delay(settings, attempt);
                if let Some(expiration) = expiration {
                    if started.elapsed() + delay >= expiration {
                        return Err(err);
                    }
                }
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let settings = RetrySettings {
            initial_interval_ms: 100,
            max_interval_ms: 1_000,
            expiration_ms: 0,
            backoff: 2.0,
        };
        let d0 = backoff_delay(&settings, 0);
        assert!(d0 >= Duration::from_millis(100) && d0 < Duration::from_millis(150));
        let d5 = backoff_delay(&settings, 5);
        assert!(d5 <= Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn stops_on_non_retryable() {
        let settings = RetrySettings::default();
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<(), &str> = retry(&settings, &cancel, |_| false, || {
            calls += 1;
            async { Err("nope") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let settings = RetrySettings {
            initial_interval_ms: 1,
            max_interval_ms: 5,
            expiration_ms: 0,
            backoff: 2.0,
        };
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<u32, &str> = retry(&settings, &cancel, |_| true, || {
            calls += 1;
            let n = calls;
            async move { if n >= 3 { Ok(n) } else { Err("flaky") } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}

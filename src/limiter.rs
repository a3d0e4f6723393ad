//! Dispatch rate limiting.
//!
//! One token bucket governs all handoffs on a partition. The desired
//! rate comes from pollers (each poll may advertise the client-side
//! limit); updates are last-writer-wins and rebuild the bucket only
//! when the value actually changed.

use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rates below this are clamped; a zero period is not representable.
const MIN_RATE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    DeadlineElapsed,
    Cancelled,
}

struct LimiterState {
    rate: f64,
    bucket: Arc<DefaultDirectRateLimiter>,
}

pub struct DispatchLimiter {
    state: RwLock<LimiterState>,
}

fn build_bucket(rate: f64) -> Arc<DefaultDirectRateLimiter> {
    let rate = rate.max(MIN_RATE);
    let period = Duration::from_secs_f64(1.0 / rate);
    let burst = NonZeroU32::new(rate.ceil().max(1.0).min(u32::MAX as f64) as u32)
        .expect("burst is at least one");
    let quota = Quota::with_period(period)
        .expect("period is non-zero")
        .allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}

impl DispatchLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            state: RwLock::new(LimiterState {
                rate,
                bucket: build_bucket(rate),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.state.read().unwrap().rate
    }

    /// Adopt a poller-advertised rate. `None` leaves the current rate in
    /// place; equal values do not reset accumulated tokens.
    pub fn set_rate(&self, rate: Option<f64>) {
        let Some(rate) = rate else { return };
        let mut state = self.state.write().unwrap();
        if (state.rate - rate).abs() < f64::EPSILON {
            return;
        }
        state.rate = rate;
        state.bucket = build_bucket(rate);
    }

    fn bucket(&self) -> Arc<DefaultDirectRateLimiter> {
        Arc::clone(&self.state.read().unwrap().bucket)
    }

    /// Wait for one token until `deadline` or cancellation.
    pub async fn acquire(
        &self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Acquire {
        let bucket = self.bucket();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = bucket.until_ready() => Acquire::Acquired,
                    _ = tokio::time::sleep_until(deadline) => Acquire::DeadlineElapsed,
                    _ = cancel.cancelled() => Acquire::Cancelled,
                }
            }
            None => {
                tokio::select! {
                    _ = bucket.until_ready() => Acquire::Acquired,
                    _ = cancel.cancelled() => Acquire::Cancelled,
                }
            }
        }
    }

    /// Wait for one token with no deadline; `false` means cancelled.
    pub async fn acquire_blocking(&self, cancel: &CancellationToken) -> bool {
        matches!(self.acquire(None, cancel).await, Acquire::Acquired)
    }

    /// Wait for one token unconditionally. Used inside race arms whose
    /// cancellation is the enclosing select dropping this future.
    pub async fn until_ready(&self) {
        self.bucket().until_ready().await;
    }
}

// src/readiness.rs

//! Bounded sleep-and-retry polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Result of a bounded poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held before the deadline
    Ready,

    /// The deadline passed first
    TimedOut,
}

impl PollOutcome {
    /// Whether the condition held before the deadline
    pub fn is_ready(self) -> bool {
        self == PollOutcome::Ready
    }
}

/// Evaluates `check` every `interval` until it returns true or `timeout`
/// elapses. The condition is always evaluated at least once.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if check().await {
            return PollOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }

        debug!("Condition not met yet, trying again");
        sleep(interval.min(deadline - now)).await;
    }
}

/// Like [`poll_until`] but yields the first value produced by `probe`
pub async fn poll_for<T, F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }

        sleep(interval.min(deadline - now)).await;
    }
}

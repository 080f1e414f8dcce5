//! Reconnection retry loop.
//!
//! Long-lived background sessions retry forever with a fixed delay between
//! attempts. The loop only stops when the operation succeeds or the caller's
//! liveness check reports that the retry was cancelled.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SessionDefaults;

/// Policy controlling the delay between reconnection attempts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay applied before every attempt, including the first.
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(SessionDefaults::RECONNECT_DELAY)
    }
}

/// Runs `op` until it succeeds, waiting `policy.delay` before each attempt.
///
/// `is_live` is checked before and after every wait; returning `false`
/// abandons the loop and yields `None`. `op` receives the 1-based attempt
/// number. Failures are logged, never returned.
pub async fn retry_with_fixed_delay<T, E, Op, Fut, Live>(
    policy: &ReconnectPolicy,
    mut is_live: Live,
    mut op: Op,
) -> Option<T>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    Live: FnMut() -> bool,
{
    let mut attempt = 0usize;

    loop {
        if !is_live() {
            debug!(event = "retry_cancelled", attempt);
            return None;
        }

        if !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }

        if !is_live() {
            debug!(event = "retry_cancelled", attempt);
            return None;
        }

        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Ok(value) => return Some(value),
            Err(error) => {
                warn!(
                    event = "reconnect_attempt_failed",
                    attempt,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %error
                );
            }
        }
    }
}

//! Bounded exponential backoff.
//!
//! Intervals double up to a cap, and a hard ceiling bounds the total time
//! spent waiting.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Give up once this much time has passed.
    pub max_elapsed: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial,
            max_interval,
            max_elapsed,
        }
    }

    /// Interval after `current`: doubled, capped at `max_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10), Duration::from_secs(120))
    }
}

/// Run `check` until it reports `true`, sleeping with exponential backoff.
///
/// A check error counts as "not yet". Exceeding `max_elapsed` is a
/// permanent failure that carries the last check error, if any.
pub async fn retry_until<F, Fut>(backoff: Backoff, what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let started = Instant::now();
    let mut interval = backoff.initial;
    let mut last_error = None;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                debug!(what, error = %e, "check failed");
                last_error = Some(e);
            }
        }

        if started.elapsed() + interval > backoff.max_elapsed {
            let waited = started.elapsed();
            return Err(match last_error {
                Some(e) => e.context(format!("timed out after {waited:?} waiting for {what}")),
                None => anyhow::anyhow!("timed out after {waited:?} waiting for {what}"),
            });
        }
        tokio::time::sleep(interval).await;
        interval = backoff.next_interval(interval);
    }
}

//! Bounded exponential backoff for optimistic-concurrency updates.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::WriteError;

/// Backoff schedule: `steps` attempts, starting at `duration` and growing by
/// `factor` after each failure. Every sleep is stretched by up to `jitter`
/// of its length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Backoff {
    pub const DEFAULT: Backoff = Backoff {
        steps: 4,
        duration: Duration::from_millis(10),
        factor: 5.0,
        jitter: 0.1,
    };

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.duration.as_secs_f64() * self.factor.powi(attempt as i32);
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(base * (1.0 + spread))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::DEFAULT
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the
/// attempt budget runs out.
///
/// `op` must redo its whole read-modify-write on every call.
pub async fn retry_on_conflict<T, F, Fut>(backoff: Backoff, mut op: F) -> Result<T, WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WriteError>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= steps {
                    return Err(WriteError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let delay = backoff.delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

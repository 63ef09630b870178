//! Retries for blocking operations.
//!
//! Allocation inputs are fetched on the allocation's own thread, so these
//! helpers block with [`std::thread::sleep`] between attempts.

use std::time::Duration;

use tracing::warn;

/// Delay between attempts of [`retry_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

/// Runs `attempt_fn` up to `1 + max_retries` times.
///
/// Errors for which `is_retryable` returns false are returned right away.
pub fn retry_with_backoff<T, E, F, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;
    loop {
        match attempt_fn() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == max_retries {
                    return Err(e);
                }
                attempt += 1;
                warn!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "attempt failed, retrying with backoff"
                );
                std::thread::sleep(delay);
                delay = backoff.next_delay(delay);
            }
        }
    }
}

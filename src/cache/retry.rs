//! Retry-with-backoff combinator used by the memoizer.
//!
//! Attempts are strictly sequential: the next attempt starts only after the
//! previous one settled and the chosen delay elapsed.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// What to do after a failed attempt that still has retries left.
#[derive(Debug)]
pub enum Backoff<T, E> {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// Stop retrying and resolve with this value.
    Resolve(T),
    /// Stop retrying and fail with this error.
    Fail(E),
}

/// Runs `op` until it succeeds, `decide` stops it, or `max_retries` retries
/// have been spent.
///
/// `op` receives the zero-based attempt number. After a failure with retries
/// left, the attempt counter is incremented and `decide(error, attempt)`
/// chooses how to continue. Once retries are exhausted the last error is
/// returned as is, without consulting `decide`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_cache::cache::{Backoff, retry_with_backoff};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let result: Result<u32, String> = retry_with_backoff(
///     2,
///     |attempt| async move { if attempt < 2 { Err(format!("attempt {attempt}")) } else { Ok(attempt) } },
///     |_err, _attempt| Backoff::Retry(Duration::ZERO),
/// )
/// .await;
/// assert_eq!(result, Ok(2));
/// # }
/// ```
pub async fn retry_with_backoff<T, E, Op, Fut, D>(
    max_retries: u32,
    mut op: Op,
    mut decide: D,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: FnMut(E, u32) -> Backoff<T, E>,
{
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= max_retries {
            debug!(attempt, max_retries, "retries exhausted");
            return Err(err);
        }

        attempt += 1;
        match decide(err, attempt) {
            Backoff::Retry(delay) => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
                tokio::time::sleep(delay).await;
            }
            Backoff::Resolve(value) => return Ok(value),
            Backoff::Fail(err) => return Err(err),
        }
    }
}

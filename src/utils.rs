//! Small helpers shared by the library and the binary.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Initial delay between engine retries
pub const ENGINE_INITIAL_BACKOFF_MS: u64 = 250;
/// Maximum delay between engine retries
pub const ENGINE_MAX_BACKOFF_MS: u64 = 4_000;
/// Maximum engine retries
pub const ENGINE_MAX_RETRIES: usize = 5;

/// Safely truncates a string to a maximum character length (not bytes).
///
/// This is UTF-8 safe and will not panic on multi-byte characters.
///
/// # Examples
///
/// ```
/// use oxide_sandbox::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Cut a byte buffer to at most `max_bytes` without splitting a UTF-8 sequence.
///
/// Returns the decoded text and whether anything was dropped. Invalid UTF-8 is
/// replaced, as interpreter output is not guaranteed to be text.
#[must_use]
pub fn lossy_prefix(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    if bytes.len() <= max_bytes {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    let mut end = max_bytes;
    // Back off continuation bytes (0b10xx_xxxx) so the cut lands on a boundary
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true)
}

/// Retry a container-engine operation with exponential backoff.
///
/// The retry strategy uses exponential backoff with jitter:
/// - Initial delay: 250ms
/// - Max delay: 4s
/// - Max attempts: 5
///
/// # Examples
///
/// ```no_run
/// use oxide_sandbox::utils::retry_with_backoff;
/// use anyhow::Result;
///
/// async fn ping() -> Result<()> {
///     Ok(())
/// }
///
/// # async fn example() -> Result<()> {
/// retry_with_backoff("ping", || async { ping().await }).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the last error if every attempt fails.
pub async fn retry_with_backoff<F, Fut, T>(what: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(ENGINE_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(ENGINE_MAX_BACKOFF_MS))
        .map(jitter)
        .take(ENGINE_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "{} failed after {} attempts: {}",
            what, ENGINE_MAX_RETRIES, e
        );
        e
    })
}

/// Cancel `stop` when `signal` fires.
///
/// A signal handler that cannot be installed leaves `stop` untouched.
pub async fn cancel_on_signal<F>(signal: F, stop: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            stop.cancel();
        }
        Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, stop the server by closing stdin"),
    }
}

//! Retry policy for transient store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;

/// Transient failures are retried this many times in total.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_DELAY_MS: u64 = 100;

/// Runs an idempotent store operation, retrying transient failures with
/// exponential backoff. Any other failure surfaces immediately.
pub async fn with_retries<T, F, Fut>(operation: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Transient(message)) if attempt < MAX_ATTEMPTS => {
                let delay = Duration::from_millis(BASE_DELAY_MS << (attempt - 1));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    pub async fn recovers_within_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result = with_retries("entities", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("timeout".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    pub async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("entities", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("timeout".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    pub async fn backend_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("entities", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Backend("boom".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

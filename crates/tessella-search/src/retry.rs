//! Retry policy for transient document store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::docstore::DocStoreError;

/// Transient failures are retried this many times in total.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_DELAY_MS: u64 = 100;

/// Runs an idempotent document store operation, retrying transient failures
/// with exponential backoff. Any other failure surfaces immediately.
pub async fn with_retries<T, F, Fut>(operation: &str, mut op: F) -> Result<T, DocStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DocStoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(DocStoreError::Transient(message)) if attempt < MAX_ATTEMPTS => {
                let delay = Duration::from_millis(BASE_DELAY_MS << (attempt - 1));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient document store failure, retrying"
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
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("search", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DocStoreError::Transient("timeout".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(DocStoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backend_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("search", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DocStoreError::Backend("boom".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(DocStoreError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

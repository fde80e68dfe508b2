// src/engine/retry.rs

use std::{future::Future, time::Duration};

use crate::{config::EngineConfig, store::StoreError};

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry_base, config.retry_max)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Runs a store call with a per-call timeout, retrying transient failures
/// up to `retries` extra times.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    retries: u32,
    backoff: Backoff,
    timeout: Duration,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{} timed out after {:?}",
                what, timeout
            ))),
        };

        match result {
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    "{} failed, retrying in {:?} (Attempt {}): {}",
                    what,
                    delay,
                    attempt,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

//! Bounded exponential-backoff wrapper for idempotent venue calls.
//!
//! Only transient failures (timeout, connect/DNS, 5xx, rate-limit) are
//! retried; anything else returns immediately. The wrapper never panics and
//! never propagates an error upward: callers read the outcome struct and
//! treat failure as "no update".

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

/// Failure classification decided at the call site.
#[derive(Debug, Clone)]
pub enum CallError {
    /// Worth retrying: timeouts, connection resets, DNS, 5xx, 429.
    Transient(String),
    /// Not worth retrying: 4xx, malformed payloads, logic errors.
    Permanent(String),
}

impl CallError {
    pub fn message(&self) -> &str {
        match self {
            CallError::Transient(m) | CallError::Permanent(m) => m,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transient(m) => write!(f, "transient: {m}"),
            CallError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 10_000,
        }
    }
}

/// What happened across all attempts.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
    pub total_time_ms: u64,
}

impl<T> RetryOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        self.data
    }
}

/// Run `op` up to `config.max_attempts` times with exponential backoff
/// (base 2, capped). `label` names the operation in logs.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let started = Instant::now();
    let mut delay = Duration::from_millis(config.base_delay_ms);
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let mut last_error = None;

    for attempt in 1..=config.max_attempts.max(1) {
        match op().await {
            Ok(data) => {
                return RetryOutcome {
                    success: true,
                    data: Some(data),
                    error: None,
                    attempts: attempt,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(CallError::Permanent(msg)) => {
                debug!(op = label, attempt, error = %msg, "non-retryable failure");
                return RetryOutcome {
                    success: false,
                    data: None,
                    error: Some(msg),
                    attempts: attempt,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(CallError::Transient(msg)) => {
                warn!(op = label, attempt, error = %msg, "transient failure");
                last_error = Some(msg);
                if attempt < config.max_attempts {
                    debug!(op = label, delay_ms = delay.as_millis() as u64, "backing off");
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    RetryOutcome {
        success: false,
        data: None,
        error: last_error,
        attempts: config.max_attempts.max(1),
        total_time_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let out = with_retry(&fast_config(), "ok", || async { Ok::<_, CallError>(7) }).await;
        assert!(out.success);
        assert_eq!(out.data, Some(7));
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast_config(), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CallError::Transient("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert!(out.success);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.data, Some(42));
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = with_retry(&fast_config(), "bad", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallError::Permanent("404".into())) }
        })
        .await;
        assert!(!out.success);
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.error.as_deref(), Some("404"));
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transient() {
        let out: RetryOutcome<()> = with_retry(&fast_config(), "down", || async {
            Err(CallError::Transient("timeout".into()))
        })
        .await;
        assert!(!out.success);
        assert_eq!(out.attempts, 3);
        assert!(out.error.is_some());
    }
}

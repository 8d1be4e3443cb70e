//! Bounded, retried store calls.
//!
//! Every attempt is capped by the lookup timeout. Transient failures
//! (`Unavailable`, timeouts) back off exponentially: base, 2×base, 4×base…
//! up to the cap. Anything else returns immediately.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::E2eeConfig;
use crate::error::E2eeError;
use crate::store::StoreError;

/// Fail with `Cancelled` if `cancel` fired.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), E2eeError> {
    if cancel.is_cancelled() {
        Err(E2eeError::Cancelled)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &E2eeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            attempt_timeout: config.lookup_timeout,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// With `cancel`, a backoff sleep is interrupted by cancellation. Pass
    /// `None` for writes that belong to a write set already under way.
    pub async fn run<T, F, Fut>(
        &self,
        op: &str,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> Result<T, E2eeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "{op} timed out after {:?}",
                    self.attempt_timeout
                ))),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= self.max_attempts {
                if attempt > 1 {
                    tracing::debug!("{op} gave up after {attempt} attempts: {error}");
                }
                return Err(error.into());
            }

            let delay = self.backoff(attempt);
            tracing::debug!("{op} attempt {attempt} failed ({error}), retrying in {delay:?}");
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(E2eeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            attempt_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("lookup", None, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StoreError::Unavailable("offline".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .run("lookup", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Unavailable("offline".into())) }
            })
            .await;
        assert!(matches!(result, Err(E2eeError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run("write", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::PermissionDenied("rules".into())) }
            })
            .await;
        assert!(matches!(result, Err(E2eeError::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_network_error() {
        let mut p = policy(1);
        p.attempt_timeout = Duration::from_millis(50);
        let result: Result<(), _> = p
            .run("lookup", None, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        match result {
            Err(E2eeError::Network(reason)) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = policy(5)
            .run("lookup", Some(&token), || async {
                Err(StoreError::Unavailable("offline".into()))
            })
            .await;
        assert!(matches!(result, Err(E2eeError::Cancelled)));
    }

    #[test]
    fn check_cancelled_reports_state() {
        let token = CancellationToken::new();
        assert!(check_cancelled(&token).is_ok());
        token.cancel();
        assert!(matches!(check_cancelled(&token), Err(E2eeError::Cancelled)));
    }
}

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::EngineError;

/// Bounded exponential backoff for engine queries.
///
/// Delay before retry `n` (1-based) is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. Only errors for which [`EngineError::is_retriable`] holds are
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op`, retrying retriable failures until the retry budget is spent.
    pub async fn run<T, Op, Fut>(
        &self,
        operation: &'static str,
        mut op: Op,
    ) -> Result<T, EngineError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retry < self.max_retries && err.is_retriable() => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retriable engine error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Http { status: 503 })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Transport("timed out".into())) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EngineError::RunNotFound {
                        run_id: "abc".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(EngineError::RunNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

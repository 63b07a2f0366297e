//! Bounded polling for long-running cloud operations.

use crate::errors::{CloudError, CloudResult};
use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep};
use tracing::trace;

/// How often to re-check an operation and how long to wait overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Call `check` until it yields a value, an error, or the timeout passes.
    /// The check runs at least once even with a zero timeout. A timeout too
    /// large to represent as a deadline never expires.
    pub async fn until<T, F, Fut>(&self, operation: &str, mut check: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<Option<T>>>,
    {
        let deadline = Instant::now().checked_add(self.timeout);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(value) = check().await? {
                return Ok(value);
            }
            let mut wait = self.interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(CloudError::Timeout {
                        operation: operation.to_string(),
                        after: self.timeout,
                    });
                }
                wait = wait.min(deadline - now);
            }
            trace!(%operation, attempt, "still waiting");
            sleep(wait).await;
        }
    }

    /// Bound a single blocking call by the timeout.
    pub async fn bounded<T, Fut>(&self, operation: &str, call: Fut) -> CloudResult<T>
    where
        Fut: Future<Output = CloudResult<T>>,
    {
        within(operation, self.timeout, call).await
    }
}

/// Fail `call` with `Timeout` if it has not finished after `timeout`.
pub async fn within<T, Fut>(operation: &str, timeout: Duration, call: Fut) -> CloudResult<T>
where
    Fut: Future<Output = CloudResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| CloudError::Timeout {
            operation: operation.to_string(),
            after: timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_once_check_succeeds() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut calls = 0;
        let value = policy
            .until("check", || {
                calls += 1;
                let done = calls == 3;
                async move { Ok(done.then_some(calls)) }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_stuck_operation() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        let err = policy
            .until("stuck", || async { Ok(None::<()>) })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Timeout { operation, .. } if operation == "stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_stop_polling() {
        let policy = PollPolicy::default();
        let err = policy
            .until("broken", || async {
                Err::<Option<()>, _>(CloudError::Transport("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_means_no_deadline() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(u64::MAX));
        let mut calls = 0;
        let value = policy
            .until("forever", || {
                calls += 1;
                let done = calls == 4;
                async move { Ok(done.then_some(calls)) }
            })
            .await
            .unwrap();
        assert_eq!(value, 4);

        let value = policy.bounded("forever", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_call_times_out() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(2));
        let err = policy
            .bounded("slow", async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn within_waits_for_slow_call() {
        let value = within("export", Duration::from_secs(120), async {
            sleep(Duration::from_secs(90)).await;
            Ok(3)
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }
}

//! Timeout and exponential backoff around external calls

use std::future::Future;
use std::time::Duration;

use crate::core::context::RunContext;
use crate::core::model::Stage;
use crate::{Error, Result, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each following one
    pub base_delay: Duration,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

/// Run `operation` with a per-attempt timeout, retrying transient failures
///
/// An attempt that exceeds the timeout counts as a `ServiceTimeout`. Errors
/// that are not transient (rejections, schema problems) return immediately.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    service: Service,
    stage: Stage,
    ctx: &RunContext,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ServiceTimeout {
                service,
                message: format!("no answer within {:?}", policy.timeout),
            }),
        };

        match outcome {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                ctx.warn(
                    stage,
                    format_args!("{e} (attempt {attempt}). Retrying in {}ms...", delay.as_millis()),
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    fn unavailable() -> Error {
        Error::ServiceUnavailable {
            service: Service::Elevation,
            message: "503".to_string(),
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = RunContext::new("test");
        let result = with_retry(&fast_policy(3), Service::Elevation, Stage::Elevation, &ctx, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = RunContext::new("test");
        let result: Result<()> = with_retry(&fast_policy(2), Service::Elevation, Stage::Elevation, &ctx, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = RunContext::new("test");
        let result: Result<()> = with_retry(&fast_policy(3), Service::Matching, Stage::Match, &ctx, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ServiceRejected {
                    service: Service::Matching,
                    message: "400".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ServiceRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };
        let ctx = RunContext::new("test");
        let result: Result<()> = with_retry(&policy, Service::Geodata, Stage::Metadata, &ctx, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::ServiceTimeout {
                service: Service::Geodata,
                ..
            })
        ));
    }
}

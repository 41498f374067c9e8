/// 可取消的等待与重试
///
/// IP 分配等待与 SSH 就绪探测都基于这里的两个原语：
/// - `wait_until`：按固定间隔轮询，直到拿到结果或超过截止时间
/// - `retry_transient`：只重试瞬时错误，其他错误立即返回

use common::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 固定间隔的有界重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// 睡眠一个间隔，期间被取消则返回 Cancelled
async fn pause(interval: Duration, cancel: &CancellationToken, operation: &str) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(operation.to_string())),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// 轮询直到 `poll` 返回 Some，超过 `timeout` 返回 Timeout
pub async fn wait_until<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut poll: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }
        if let Some(value) = poll().await? {
            return Ok(value);
        }
        if Instant::now() + interval > deadline {
            error!(operation = %operation, timeout_secs = timeout.as_secs(), "等待超时");
            return Err(Error::Timeout(format!("{} 超过 {:?} 仍未完成", operation, timeout)));
        }
        debug!(operation = %operation, "尚未就绪，{:?} 后重试", interval);
        pause(interval, cancel, operation).await?;
    }
}

/// 重试瞬时错误，非瞬时错误立即返回，次数耗尽返回 Timeout
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_attempts {
                    error!(operation = %operation, attempt, error = %e, "重试次数耗尽");
                    return Err(Error::Timeout(format!(
                        "{} 重试 {} 次后仍失败: {}",
                        operation, attempt, e
                    )));
                }
                warn!(operation = %operation, attempt, error = %e, "暂不可用，稍后重试");
                pause(policy.interval, cancel, operation).await?;
            }
            Err(e) => {
                error!(operation = %operation, attempt, error = %e, "不可重试的错误");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const FAST: RetryPolicy = RetryPolicy {
        max_attempts: 5,
        interval: Duration::from_millis(1),
    };

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_transient(FAST, "probe", &CancellationToken::new(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::Connectivity("refused".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<()> = retry_transient(FAST, "probe", &CancellationToken::new(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Authentication("denied".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_timeout() {
        let result: Result<()> = retry_transient(FAST, "probe", &CancellationToken::new(), || async {
            Err(Error::Connectivity("refused".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result: Result<u32> = wait_until(
            "ip",
            Duration::from_millis(5),
            Duration::from_millis(20),
            &CancellationToken::new(),
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_until_returns_value() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let value = wait_until(
            "ip",
            Duration::from_millis(1),
            Duration::from_secs(5),
            &CancellationToken::new(),
            || {
                let c = c.clone();
                async move { Ok((c.fetch_add(1, Ordering::SeqCst) >= 2).then_some(7u32)) }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32> =
            wait_until("ip", Duration::from_secs(1), Duration::from_secs(5), &cancel, || async {
                Ok(None)
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}

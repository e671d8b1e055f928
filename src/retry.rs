//! 指数退避重试

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::model::config::RetryConfig;

/// 重试策略
///
/// `max_attempts` 为总尝试次数（含首次）。第 n 次失败后等待
/// `min(initial * factor^(n-1), max)`，再叠加 `jitter` 比例的随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            factor: config.backoff_factor.max(1.0),
            jitter: 0.1,
        }
    }

    /// 第 `failures` 次失败之后的等待时间（从 1 开始计）
    pub fn delay_for(&self, failures: usize) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let spread = if self.jitter > 0.0 {
            capped * self.jitter * (fastrand::f64() * 2.0 - 1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + spread).clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// 执行 `op`，可重试的错误按退避策略重试，其余错误立即返回
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        tracing::error!("{} 连续失败 {} 次，放弃: {}", what, failures, e);
                        return Err(e);
                    }
                    let delay = self.delay_for(failures);
                    tracing::warn!(
                        "{} 第 {} 次尝试失败: {}，{:.1} 秒后重试",
                        what,
                        failures,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

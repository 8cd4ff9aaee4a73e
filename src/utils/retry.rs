use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use crate::core::{Result, UploaderError};

/// 重试策略
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed(Duration),
    /// 指数退避
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// 计算第 n 次重试的延迟
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(attempt as f64);
                let delay = Duration::from_secs_f64(delay);
                std::cmp::min(delay, *max_delay)
            }
        }
    }
}

/// 重试配置
struct RetryConfig {
    /// 最大重试次数
    max_attempts: u32,
    /// 重试策略
    strategy: RetryStrategy,
    /// 是否重试的判断函数
    should_retry: Box<dyn Fn(&UploaderError) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            should_retry: Box::new(is_transient),
        }
    }
}

/// 网络错误和服务端 5xx 可以重试
fn is_transient(error: &UploaderError) -> bool {
    match error {
        UploaderError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        UploaderError::Authorization { status_code, .. } => *status_code >= 500 || *status_code == 429,
        _ => false,
    }
}

/// 执行带重试的操作
async fn retry_with_config<F, Fut, T>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    
    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                // 检查是否应该重试
                if !(config.should_retry)(&error) {
                    return Err(error);
                }
                
                last_error = Some(error);
                
                // 如果不是最后一次尝试，等待后重试
                if attempt + 1 < config.max_attempts {
                    let delay = config.strategy.get_delay(attempt);
                    debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying operation");
                    sleep(delay).await;
                }
            }
        }
    }
    
    // 所有重试都失败了
    Err(last_error.unwrap_or_else(|| UploaderError::internal("retry limit exceeded without attempts")))
}

/// 重试构建器
pub struct RetryBuilder {
    config: RetryConfig,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }
    
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }
    
    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }
    
    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_config(self.config, operation).await
    }
}

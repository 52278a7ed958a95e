/// 带宽限制器模块
///
/// 使用 token bucket 算法（GCRA）实现全局带宽限制，一个令牌对应一个字节，
/// 所有连接共享同一个令牌桶，因此配置的速率是总带宽上限
use crate::error::{ProxyError, Result};
use futures::future::BoxFuture;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    InsufficientCapacity, Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 默认带宽上限（512 KiB/s）
pub const DEFAULT_RATE: u32 = 512 * 1024;

/// 带宽限制器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthConfig {
    /// 每秒允许的字节数
    pub bytes_per_second: u32,
    /// 突发容量（令牌桶容量，单位字节）
    pub burst_bytes: u32,
}

impl BandwidthConfig {
    /// 容量与速率相同的配置
    pub fn with_rate(bytes_per_second: u32) -> Self {
        Self {
            bytes_per_second,
            burst_bytes: bytes_per_second,
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self::with_rate(DEFAULT_RATE)
    }
}

/// 全局带宽限制器
///
/// 克隆得到的限制器共享同一个令牌桶
#[derive(Clone)]
pub struct BandwidthLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: BandwidthConfig,
    burst: NonZeroU32,
}

impl BandwidthLimiter {
    /// 创建新的带宽限制器
    pub fn new(config: BandwidthConfig) -> Result<Self> {
        let rate = NonZeroU32::new(config.bytes_per_second)
            .ok_or_else(|| ProxyError::config_error("rate must be > 0"))?;
        let burst = NonZeroU32::new(config.burst_bytes)
            .ok_or_else(|| ProxyError::config_error("burst must be > 0"))?;

        let quota = Quota::per_second(rate).allow_burst(burst);

        Ok(Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config,
            burst,
        })
    }

    /// 使用默认配置
    pub fn with_defaults() -> Self {
        let burst = NonZeroU32::new(DEFAULT_RATE).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(GovernorLimiter::direct(
                Quota::per_second(burst).allow_burst(burst),
            )),
            config: BandwidthConfig::default(),
            burst,
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &BandwidthConfig {
        &self.config
    }

    /// 单次最多能授予的字节数（即令牌桶容量）
    pub fn max_grant(&self) -> usize {
        self.burst.get() as usize
    }

    /// 尝试立即获取 `bytes` 个令牌（非阻塞）
    ///
    /// 返回 Err(Duration) 表示需要等待的时间；超过容量的请求永远无法一次获得，
    /// 此时返回 Duration::MAX
    pub fn try_acquire(&self, bytes: u32) -> std::result::Result<(), Duration> {
        let Some(n) = NonZeroU32::new(bytes) else {
            return Ok(());
        };
        match self.inner.check_n(n) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(not_until)) => Err(not_until.wait_time_from(DefaultClock::default().now())),
            Err(InsufficientCapacity(_)) => Err(Duration::MAX),
        }
    }

    /// 异步等待直到获得 `bytes` 个令牌
    ///
    /// 大于容量的请求分批获取，每批不超过容量；全部获取完成后才返回
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = bytes;
        let mut chunk_limit = self.burst.get();

        while remaining > 0 {
            let chunk = remaining.min(chunk_limit as usize) as u32;
            let Some(n) = NonZeroU32::new(chunk) else {
                break;
            };

            match self.inner.check_n(n) {
                Ok(Ok(())) => remaining -= chunk as usize,
                Ok(Err(not_until)) => {
                    let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait_time).await;
                }
                Err(InsufficientCapacity(capacity)) => chunk_limit = capacity.max(1),
            }
        }
    }

    /// 返回一个拥有所有权的获取令牌 future，供 poll 风格的 I/O 使用
    pub fn acquire_owned(&self, bytes: usize) -> BoxFuture<'static, ()> {
        let limiter = self.clone();
        Box::pin(async move { limiter.acquire(bytes).await })
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("config", &self.config)
            .finish()
    }
}

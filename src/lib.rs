/// Throttled Proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod body;
pub mod cli;
pub mod config;
pub mod dialer;
pub mod error;
pub mod forward;
pub mod limited_stream;
pub mod rate_limiter;
pub mod relay;
pub mod server;
pub mod stats;
pub mod tunnel;

// 重新导出常用类型
pub use config::{parse_rate, ProxyConfig};
pub use error::{ProxyError, Result};
pub use limited_stream::RateLimitedStream;
pub use rate_limiter::{BandwidthConfig, BandwidthLimiter, DEFAULT_RATE};
pub use server::{run_proxy, ProxyServer, ServerState};
pub use stats::{TrafficSnapshot, TrafficStats};

use crate::error::{ProxyError, Result};
use crate::limited_stream::RateLimitedStream;
use crate::rate_limiter::BandwidthLimiter;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 出站连接参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialConfig {
    /// 连接建立超时
    pub connect_timeout: Duration,
    /// TCP keepalive 首次探测时间
    pub keepalive: Duration,
}

impl DialConfig {
    /// CONNECT 隧道使用的参数（10 秒超时，30 分钟 keepalive）
    pub fn tunnel() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30 * 60),
        }
    }

    /// 普通 HTTP 转发使用的参数（3 秒超时，30 分钟 keepalive）
    pub fn forward() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            keepalive: Duration::from_secs(30 * 60),
        }
    }
}

/// 连接目标地址（host:port），带超时和 keepalive
///
/// 解析出的所有地址依次尝试，所有失败都归为 `ProxyError::Dial`
pub async fn dial(addr: &str, config: &DialConfig) -> Result<TcpStream> {
    if !has_port(addr) {
        return Err(ProxyError::dial(
            addr,
            io::Error::new(io::ErrorKind::InvalidInput, "missing port in address"),
        ));
    }

    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::dial(addr, e)),
        Err(_) => {
            return Err(ProxyError::dial(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"),
            ))
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    apply_keepalive(&stream, config.keepalive);

    debug!("Dialed {} ({:?})", addr, stream.peer_addr().ok());
    Ok(stream)
}

/// 连接目标地址并包装为限速连接
pub async fn dial_limited(
    addr: &str,
    config: &DialConfig,
    limiter: &BandwidthLimiter,
) -> Result<RateLimitedStream<TcpStream>> {
    let stream = dial(addr, config).await?;
    Ok(RateLimitedStream::new(stream, limiter.clone()))
}

fn apply_keepalive(stream: &TcpStream, time: Duration) {
    let keepalive = TcpKeepalive::new().with_time(time);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// `host:port` / `[v6]:port` 是否带端口
fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}

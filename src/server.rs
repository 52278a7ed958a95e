/// 代理服务器
///
/// 生命周期：Starting → Serving → ShuttingDown → Stopped。
/// 收到关闭信号后停止监听，通知空闲连接关闭，然后等待所有进行中的请求和隧道结束
use crate::body::ProxyBody;
use crate::config::ProxyConfig;
use crate::dialer::DialConfig;
use crate::error::Result;
use crate::forward::handle_http;
use crate::rate_limiter::BandwidthLimiter;
use crate::stats::{format_bytes, TrafficSnapshot, TrafficStats};
use crate::tunnel::handle_tunneling;
use anyhow::Context;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// 所有请求处理器共享的状态
pub struct ProxyContext {
    /// 全局令牌桶
    pub limiter: BandwidthLimiter,
    pub tunnel_dial: DialConfig,
    pub forward_dial: DialConfig,
    /// 连接、中继和出站连接任务
    pub tasks: TaskTracker,
    pub stats: TrafficStats,
}

impl ProxyContext {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            limiter: BandwidthLimiter::new(config.bandwidth())?,
            tunnel_dial: config.tunnel_dial(),
            forward_dial: config.forward_dial(),
            tasks: TaskTracker::new(),
            stats: TrafficStats::new(),
        })
    }
}

/// 服务器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    shutdown: CancellationToken,
    state: watch::Sender<ServerState>,
}

impl ProxyServer {
    /// 绑定监听地址并创建共享的令牌桶
    pub async fn bind(config: &ProxyConfig, shutdown: CancellationToken) -> Result<Self> {
        let (state, _) = watch::channel(ServerState::Starting);
        let ctx = ProxyContext::new(config)?;
        let listener = TcpListener::bind(config.listen_addr()).await?;

        info!(
            "Bandwidth limit: {}/s (burst {})",
            format_bytes(ctx.limiter.config().bytes_per_second as u64),
            format_bytes(ctx.limiter.config().burst_bytes as u64)
        );

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            shutdown,
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 订阅生命周期状态
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> TrafficStats {
        self.ctx.stats.clone()
    }

    /// 接受连接直到关闭信号到来，然后等待所有任务结束
    pub async fn serve(self) -> Result<TrafficSnapshot> {
        let Self {
            listener,
            ctx,
            shutdown,
            state,
        } = self;

        let local_addr = listener.local_addr()?;
        state.send_replace(ServerState::Serving);
        info!("Proxy listening on {}", local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted connection from {}", remote_addr);
                        ctx.tasks.spawn(serve_connection(
                            stream,
                            remote_addr,
                            ctx.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping proxy...");
                    break;
                }
            }
        }

        // 停止监听，新连接将被拒绝
        drop(listener);
        state.send_replace(ServerState::ShuttingDown);

        ctx.tasks.close();
        info!(
            "Waiting for {} in-flight task(s) to finish",
            ctx.tasks.len()
        );
        ctx.tasks.wait().await;

        let snapshot = ctx.stats.snapshot();
        info!(
            requests = snapshot.total_requests,
            tunnels = snapshot.total_tunnels,
            forwarded = snapshot.forwarded_requests,
            failures = snapshot.upstream_failures,
            relayed = %format_bytes(snapshot.bytes_relayed),
            "Traffic summary"
        );

        state.send_replace(ServerState::Stopped);
        info!("Exiting");
        Ok(snapshot)
    }
}

/// 在一条客户端连接上提供 HTTP/1.x 服务
async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
    }

    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(dispatch(req, remote_addr, ctx).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = shutdown.cancelled(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} closed: {}", remote_addr, e);
    }
}

/// 记录请求并按方法分派
async fn dispatch(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Response<ProxyBody> {
    info!("{} {} {}", req.method(), remote_addr, req.uri());
    ctx.stats.request_received();

    if req.method() == Method::CONNECT {
        handle_tunneling(req, ctx).await
    } else {
        handle_http(req, ctx).await
    }
}

/// 绑定并运行代理，直到 `shutdown` 被取消且所有连接结束
pub async fn run_proxy(
    config: ProxyConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<TrafficSnapshot> {
    let server = ProxyServer::bind(&config, shutdown)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
    let snapshot = server.serve().await?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ProxyConfig {
        ProxyConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_context_from_config() {
        let config = ProxyConfig {
            rate: 4096,
            burst: Some(8192),
            forward_connect_timeout_ms: 500,
            ..Default::default()
        };
        let ctx = ProxyContext::new(&config).unwrap();
        assert_eq!(ctx.limiter.config().bytes_per_second, 4096);
        assert_eq!(ctx.limiter.max_grant(), 8192);
        assert_eq!(ctx.forward_dial.connect_timeout, Duration::from_millis(500));
        assert_eq!(ctx.tunnel_dial, DialConfig::tunnel());
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let shutdown = CancellationToken::new();
        let server = ProxyServer::bind(&local_config(), shutdown.clone())
            .await
            .unwrap();
        let mut state = server.state();
        assert_eq!(*state.borrow(), ServerState::Starting);

        let handle = tokio::spawn(server.serve());
        state
            .wait_for(|s| *s == ServerState::Serving)
            .await
            .unwrap();

        shutdown.cancel();
        let snapshot = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(*state.borrow(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            port: taken.local_addr().unwrap().port(),
            ..local_config()
        };

        let err = run_proxy(config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to bind"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServerState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(ServerState::Serving.to_string(), "serving");
    }
}

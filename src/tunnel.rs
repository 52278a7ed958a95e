/// CONNECT 隧道模块
///
/// 连接目标后接管客户端原始连接，启动两个相互独立的中继任务；
/// 只有目标一侧的连接被限速
use crate::body::{empty, error_response, ProxyBody};
use crate::dialer::dial_limited;
use crate::error::{ProxyError, Result};
use crate::limited_stream::ByteStream;
use crate::relay::{transfer, TUNNEL_DESCRIPTION};
use crate::server::ProxyContext;
use crate::stats::TrafficStats;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 处理 CONNECT 请求
///
/// 连接失败返回 503，无法接管连接返回 500，成功返回 200 后开始中继
pub async fn handle_tunneling(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Response<ProxyBody> {
    let target = match connect_target(&req) {
        Ok(target) => target,
        Err(e) => {
            warn!("CONNECT rejected: {}", e);
            ctx.stats.upstream_failed();
            return error_response(e.status_code(), &e.to_string());
        }
    };

    let destination = match dial_limited(&target, &ctx.tunnel_dial, &ctx.limiter).await {
        Ok(stream) => stream,
        Err(e) => {
            if e.is_timeout() {
                warn!(
                    "CONNECT {} timed out after {:?}",
                    target, ctx.tunnel_dial.connect_timeout
                );
            } else {
                warn!("CONNECT {} failed: {}", target, e);
            }
            ctx.stats.upstream_failed();
            return error_response(e.status_code(), &e.to_string());
        }
    };

    // 接管客户端连接；之后这条连接不再是 HTTP 请求/响应流
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        let e = ProxyError::HijackUnsupported;
        warn!("CONNECT {}: {}", target, e);
        return error_response(e.status_code(), &e.to_string());
    };

    let tasks = ctx.tasks.clone();
    let stats = ctx.stats.clone();
    ctx.tasks.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                info!("Tunnel established to {}", target);
                spawn_relays(&tasks, TokioIo::new(upgraded), destination, stats);
            }
            Err(e) => warn!("CONNECT {}: upgrade error: {}", target, e),
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::OK;
    response
}

/// CONNECT 请求的目标 `host:port`
fn connect_target(req: &Request<Incoming>) -> Result<String> {
    authority_of(req.uri())
}

fn authority_of(uri: &http::Uri) -> Result<String> {
    uri.authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| {
            ProxyError::dial(
                uri.to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing address"),
            )
        })
}

/// 启动隧道的两个中继任务（客户端→目标，目标→客户端）
///
/// 任一方向结束都会关闭两端，另一个方向随之结束
pub fn spawn_relays<C, D>(tasks: &TaskTracker, client: C, destination: D, stats: TrafficStats)
where
    C: ByteStream,
    D: ByteStream,
{
    let session = CancellationToken::new();
    let (client_read, client_write) = tokio::io::split(client);
    let (dest_read, dest_write) = tokio::io::split(destination);

    stats.tunnel_opened();
    let finished = Arc::new(AtomicBool::new(false));

    let upstream = {
        let session = session.clone();
        let stats = stats.clone();
        let finished = finished.clone();
        async move {
            let _ = transfer(dest_write, client_read, TUNNEL_DESCRIPTION, session, stats.clone())
                .await;
            close_session(&finished, &stats);
        }
    };

    let downstream = async move {
        let _ = transfer(client_write, dest_read, TUNNEL_DESCRIPTION, session, stats.clone()).await;
        close_session(&finished, &stats);
    };

    tasks.spawn(upstream);
    tasks.spawn(downstream);
}

/// 第二个结束的中继负责记录隧道关闭
fn close_session(finished: &AtomicBool, stats: &TrafficStats) {
    if finished.swap(true, Ordering::AcqRel) {
        stats.tunnel_closed();
        debug!("Tunnel closed");
    }
}

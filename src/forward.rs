/// 普通 HTTP 转发模块
///
/// 非 CONNECT 请求通过限速连接发往目标服务器，响应的状态码、
/// 所有响应头（同名头按原顺序）和响应体原样返回给客户端
use crate::body::{error_response, LoggedBody, ProxyBody};
use crate::dialer::dial_limited;
use crate::error::{ProxyError, Result};
use crate::server::ProxyContext;
use http::header::{HeaderMap, HeaderValue, HOST};
use http::{Request, Response, Uri};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

/// 处理普通 HTTP 请求，失败时返回 503
pub async fn handle_http(req: Request<Incoming>, ctx: Arc<ProxyContext>) -> Response<ProxyBody> {
    match forward(req, &ctx).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_timeout() {
                warn!(
                    "Forward timed out after {:?}: {}",
                    ctx.forward_dial.connect_timeout, e
                );
            } else {
                warn!("Forward failed: {}", e);
            }
            ctx.stats.upstream_failed();
            error_response(e.status_code(), &e.to_string())
        }
    }
}

async fn forward(req: Request<Incoming>, ctx: &ProxyContext) -> Result<Response<ProxyBody>> {
    let request_uri = req.uri().to_string();
    let target = forward_target(req.uri())?;

    let stream = dial_limited(&target, &ctx.forward_dial, &ctx.limiter).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ProxyError::transport)?;

    let conn_target = target.clone();
    ctx.tasks.spawn(async move {
        if let Err(e) = conn.await {
            debug!("Outbound connection to {} closed: {}", conn_target, e);
        }
    });

    let outbound = outbound_request(req)?;
    let upstream = sender
        .send_request(outbound)
        .await
        .map_err(ProxyError::transport)?;

    ctx.stats.request_forwarded();

    let (parts, body) = upstream.into_parts();
    let body = LoggedBody::new(body, request_uri, ctx.stats.clone()).boxed();

    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    copy_headers(response.headers_mut(), &parts.headers);

    Ok(response)
}

/// 从绝对形式的请求 URI 解析出 `host:port`（默认 80 端口）
pub fn forward_target(uri: &Uri) -> Result<String> {
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(ProxyError::Transport(format!(
                "unsupported protocol scheme \"{}\"",
                other
            )))
        }
        None => {
            return Err(ProxyError::Transport(
                "unsupported protocol scheme \"\"".to_string(),
            ))
        }
    }

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::Transport(format!("no Host in request URL {}", uri)))?;
    let port = uri.port_u16().unwrap_or(80);

    Ok(format!("{}:{}", host, port))
}

/// 将代理请求改写为发往源站的请求
///
/// 方法、请求头和请求体保持不变；请求目标改为 origin-form，
/// 缺少 Host 头时用 URI 中的 authority 补齐
pub fn outbound_request<B: Body>(req: Request<B>) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            let value = HeaderValue::from_str(authority.as_str()).map_err(ProxyError::transport)?;
            parts.headers.insert(HOST, value);
        }
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    parts.uri = path.parse::<Uri>().map_err(ProxyError::transport)?;

    Ok(Request::from_parts(parts, body))
}

/// 复制所有响应头，同名头的多个值按原顺序追加
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for key in src.keys() {
        for value in src.get_all(key) {
            dst.append(key.clone(), value.clone());
        }
    }
}

/// 代理返回的响应体
///
/// 上游响应体经由 [`LoggedBody`] 流回客户端：统计交付的字节数，
/// 响应体结束时以请求 URI 为描述记录大小、耗时与速率
use crate::relay::{log_transfer, TransferReport};
use crate::stats::{format_bytes, TrafficStats};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::warn;

/// Body type of every response the proxy returns
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Empty body (CONNECT 200 responses).
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Body with fixed content.
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain text error reply, one line of text followed by a newline.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    response
}

/// Wrapper that counts and logs the bytes streamed through a body.
///
/// The log line is written when the inner body ends. An error or a body
/// dropped before its end (client went away) is logged as a warning.
pub struct LoggedBody<B> {
    inner: B,
    description: String,
    stats: TrafficStats,
    start: Instant,
    bytes: u64,
    finished: bool,
}

impl<B: Body> LoggedBody<B> {
    /// 包装上游响应体
    ///
    /// 一开始就已结束的响应体（204、304、HEAD、`Content-Length: 0`）不会被轮询，
    /// 因此在这里直接记录零字节的传输
    pub fn new(inner: B, description: impl Into<String>, stats: TrafficStats) -> Self {
        let mut body = Self {
            inner,
            description: description.into(),
            stats,
            start: Instant::now(),
            bytes: 0,
            finished: false,
        };

        if body.inner.is_end_stream() {
            body.finished = true;
            log_transfer(&body.description, &body.report());
        }

        body
    }
}

impl<B> LoggedBody<B> {
    fn report(&self) -> TransferReport {
        TransferReport {
            bytes: self.bytes,
            duration: self.start.elapsed(),
        }
    }
}

impl<B> Body for LoggedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                    this.stats.add_bytes(data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                warn!(
                    "{} after {}: {}",
                    this.description,
                    format_bytes(this.bytes),
                    e
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    log_transfer(&this.description, &this.report());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for LoggedBody<B> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "{} aborted after {}",
                self.description,
                format_bytes(self.bytes)
            );
        }
    }
}

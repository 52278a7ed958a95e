/// 限速连接模块
///
/// 对任意字节流做装饰：每次读写都先从共享的带宽限制器获取与字节数相等的令牌，
/// 令牌不足时读写调用本身被挂起，背压通过 TCP 流控传回对端
use crate::rate_limiter::BandwidthLimiter;
use futures::future::BoxFuture;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// 可被装饰的字节流能力集合（read / write / shutdown）
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 限速连接 - 独占内部连接，共享带宽限制器
pub struct RateLimitedStream<S> {
    inner: S,
    limiter: BandwidthLimiter,
    /// 已从内部连接读出、尚未交给调用者的数据
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    /// 为已读出数据等待令牌
    read_wait: Option<BoxFuture<'static, ()>>,
    /// 为即将写入的数据等待令牌
    write_wait: Option<BoxFuture<'static, ()>>,
    /// 已获得令牌但尚未写出的字节数
    write_credit: usize,
}

impl<S> RateLimitedStream<S> {
    /// 创建新的限速连接
    pub fn new(inner: S, limiter: BandwidthLimiter) -> Self {
        Self {
            inner,
            limiter,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
            read_wait: None,
            write_wait: None,
            write_credit: 0,
        }
    }

    /// 获取内部连接的引用
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// 获取共享的带宽限制器
    pub fn limiter(&self) -> &BandwidthLimiter {
        &self.limiter
    }

    fn buffered(&self) -> usize {
        self.read_len - self.read_pos
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RateLimitedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // 1. 缓冲区为空时从内部连接读取
        if this.buffered() == 0 {
            if this.read_buf.is_empty() {
                this.read_buf = vec![0u8; READ_BUFFER_SIZE];
            }

            let mut inner_buf = ReadBuf::new(&mut this.read_buf);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut inner_buf))?;

            let read = inner_buf.filled().len();
            if read == 0 {
                // EOF
                return Poll::Ready(Ok(()));
            }

            this.read_pos = 0;
            this.read_len = read;
            this.read_wait = Some(this.limiter.acquire_owned(read));
        }

        // 2. 等待已读字节数对应的令牌
        if let Some(wait) = this.read_wait.as_mut() {
            ready!(wait.as_mut().poll(cx));
            this.read_wait = None;
        }

        // 3. 交付数据
        let n = this.buffered().min(buf.remaining());
        buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
        this.read_pos += n;

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RateLimitedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        loop {
            if let Some(wait) = this.write_wait.as_mut() {
                ready!(wait.as_mut().poll(cx));
                this.write_wait = None;
            }

            if this.write_credit > 0 {
                let grant = this.write_credit.min(buf.len());
                let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..grant]))?;
                this.write_credit -= written;
                return Poll::Ready(Ok(written));
            }

            // 单次最多申请一个令牌桶容量
            let want = buf.len().min(this.limiter.max_grant());
            this.write_wait = Some(this.limiter.acquire_owned(want));
            this.write_credit = want;
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for RateLimitedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedStream")
            .field("inner", &self.inner)
            .field("buffered", &self.buffered())
            .field("write_credit", &self.write_credit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::BandwidthConfig;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn limiter(rate: u32, burst: u32) -> BandwidthLimiter {
        BandwidthLimiter::new(BandwidthConfig {
            bytes_per_second: rate,
            burst_bytes: burst,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_passes_data_through() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut limited = RateLimitedStream::new(client, limiter(1024 * 1024, 64 * 1024));

        limited.write_all(b"Hello, World!").await.unwrap();
        limited.flush().await.unwrap();

        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_read_passes_data_through() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut limited = RateLimitedStream::new(client, limiter(1024 * 1024, 64 * 1024));

        server.write_all(b"ping").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        limited.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }

    #[tokio::test]
    async fn test_write_is_rate_limited() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut limited = RateLimitedStream::new(client, limiter(8192, 1024));

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            server.read_exact(&mut buf).await.unwrap();
            buf
        });

        let start = Instant::now();
        let payload = vec![7u8; 4096];
        limited.write_all(&payload).await.unwrap();

        // (4096 - 1024) / 8192 = 375ms
        assert!(start.elapsed() >= Duration::from_millis(330));
        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_read_is_rate_limited() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut limited = RateLimitedStream::new(client, limiter(8192, 1024));

        server.write_all(&[1u8; 4096]).await.unwrap();
        drop(server);

        let start = Instant::now();
        let mut out = Vec::new();
        limited.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), 4096);
        assert!(start.elapsed() >= Duration::from_millis(330));
    }

    #[tokio::test]
    async fn test_shared_limiter_across_streams() {
        let shared = limiter(8192, 1024);
        let (a, mut a_peer) = tokio::io::duplex(64 * 1024);
        let (b, mut b_peer) = tokio::io::duplex(64 * 1024);
        let mut a = RateLimitedStream::new(a, shared.clone());
        let mut b = RateLimitedStream::new(b, shared);

        let drain_a = tokio::spawn(async move {
            let mut sink = Vec::new();
            a_peer.read_to_end(&mut sink).await.unwrap();
            sink.len()
        });
        let drain_b = tokio::spawn(async move {
            let mut sink = Vec::new();
            b_peer.read_to_end(&mut sink).await.unwrap();
            sink.len()
        });

        let start = Instant::now();
        tokio::join!(
            async {
                a.write_all(&[0u8; 2048]).await.unwrap();
                a.shutdown().await.unwrap();
            },
            async {
                b.write_all(&[0u8; 2048]).await.unwrap();
                b.shutdown().await.unwrap();
            }
        );

        // 两条连接共享 8192 B/s：(4096 - 1024) / 8192 = 375ms
        assert!(start.elapsed() >= Duration::from_millis(330));
        assert_eq!(drain_a.await.unwrap(), 2048);
        assert_eq!(drain_b.await.unwrap(), 2048);
    }

    #[tokio::test]
    async fn test_io_errors_pass_through() {
        struct FailingStream;

        impl AsyncRead for FailingStream {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            }
        }

        impl AsyncWrite for FailingStream {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")))
            }

            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let mut limited = RateLimitedStream::new(FailingStream, limiter(1024, 1024));

        let mut buf = [0u8; 16];
        let err = limited.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let err = limited.write(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_small_reader_buffer() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut limited = RateLimitedStream::new(client, limiter(1024 * 1024, 64 * 1024));

        server.write_all(b"abcdef").await.unwrap();
        drop(server);

        // 调用者缓冲区小于已读出的数据时分多次交付
        let mut first = [0u8; 4];
        limited.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"abcd");

        let mut rest = Vec::new();
        limited.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }
}

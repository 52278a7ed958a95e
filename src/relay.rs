/// 数据中继模块
///
/// 在两个端点之间单向复制数据，直到源端 EOF 或出错；
/// 结束时无论成功与否都关闭两端，并记录传输量、耗时与速率
use crate::error::{ProxyError, Result};
use crate::stats::{format_bytes, TrafficStats};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 数据复制缓冲区大小
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// 隧道中继日志使用的描述
pub const TUNNEL_DESCRIPTION: &str = "Transferred";

/// 一次传输的统计结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    pub bytes: u64,
    pub duration: Duration,
}

impl TransferReport {
    /// 平均速率（字节/秒）
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            self.bytes as f64
        }
    }

    /// 人类可读的速率，例如 "1.50 KB/s"
    pub fn rate(&self) -> String {
        format!("{}/s", format_bytes(self.bytes_per_second() as u64))
    }
}

/// 记录一次完成的传输
pub fn log_transfer(description: &str, report: &TransferReport) {
    info!(
        size = %format_bytes(report.bytes),
        duration = ?report.duration,
        rate = %report.rate(),
        "{}",
        description
    );
}

/// 复制数据直到源端 EOF、出错或会话被取消
///
/// 无论结果如何都返回已复制的字节数
async fn copy_until_closed<W, R>(
    destination: &mut W,
    source: &mut R,
    session: &CancellationToken,
    stats: &TrafficStats,
) -> (u64, io::Result<()>)
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total_copied = 0u64;

    loop {
        let n = tokio::select! {
            result = source.read(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => return (total_copied, Err(e)),
            },
            _ = session.cancelled() => break,
        };

        if n == 0 {
            break;
        }

        tokio::select! {
            result = destination.write_all(&buf[..n]) => {
                if let Err(e) = result {
                    return (total_copied, Err(e));
                }
            }
            _ = session.cancelled() => break,
        }

        total_copied += n as u64;
        stats.add_bytes(n as u64);
    }

    (total_copied, destination.flush().await)
}

/// 复制并记录日志；复制错误记为警告并以 `ProxyError::Copy` 返回
pub async fn copy_with_log<W, R>(
    destination: &mut W,
    source: &mut R,
    description: &str,
    session: &CancellationToken,
    stats: &TrafficStats,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let start = Instant::now();
    let (bytes, result) = copy_until_closed(destination, source, session, stats).await;

    match result {
        Ok(()) => {
            log_transfer(
                description,
                &TransferReport {
                    bytes,
                    duration: start.elapsed(),
                },
            );
            Ok(bytes)
        }
        Err(e) => {
            warn!("{} after {}: {}", description, format_bytes(bytes), e);
            Err(ProxyError::copy(description, e))
        }
    }
}

/// 单向中继：复制结束后关闭目标写端、释放源端，并取消同一会话，
/// 使另一个方向也随之结束
pub async fn transfer<W, R>(
    mut destination: W,
    mut source: R,
    description: &str,
    session: CancellationToken,
    stats: TrafficStats,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let result = copy_with_log(&mut destination, &mut source, description, &session, &stats).await;

    if let Err(e) = destination.shutdown().await {
        debug!("{}: shutdown error: {}", description, e);
    }
    session.cancel();
    drop(source);
    drop(destination);

    result
}

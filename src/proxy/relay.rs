/// 数据转发模块
///
/// 两个方向各跑一个任务，共享一个取消信号：
/// 任一方向结束（EOF、读写错误）都会触发取消，另一方向随即退出。
/// 两个任务都结束后才返回，流在此时各关闭一次。

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// 单向缓冲区大小
const BUFFER_SIZE: usize = 32 * 1024;

/// 双向转发数据
///
/// 返回 (a->b 字节数, b->a 字节数)。转发过程中的 IO 错误视为正常结束。
pub async fn relay<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let cancel = CancellationToken::new();

    let a_to_b = tokio::spawn(copy_until_cancelled(a_read, b_write, cancel.clone(), "a->b"));
    let b_to_a = tokio::spawn(copy_until_cancelled(b_read, a_write, cancel.clone(), "b->a"));

    let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
    let up = a_to_b.unwrap_or_else(|e| {
        warn!("a->b relay task failed: {}", e);
        0
    });
    let down = b_to_a.unwrap_or_else(|e| {
        warn!("b->a relay task failed: {}", e);
        0
    });

    debug!("Relay finished: {} bytes a->b, {} bytes b->a", up, down);
    (up, down)
}

/// 单向转发，直到 EOF、出错或收到取消信号
async fn copy_until_cancelled<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    cancel: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total_bytes = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("{}: cancelled while reading", direction);
                break;
            }
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    trace!("{}: EOF reached", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{}: read error: {}", direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("{}: cancelled while writing", direction);
                break;
            }
            written = async {
                writer.write_all(&buffer[..n]).await?;
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            debug!("{}: write error: {}", direction, e);
            break;
        }

        total_bytes += n as u64;
    }

    cancel.cancel();

    if let Err(e) = writer.shutdown().await {
        trace!("{}: shutdown error (may be expected): {}", direction, e);
    }

    debug!("{}: transferred {} bytes", direction, total_bytes);
    total_bytes
}

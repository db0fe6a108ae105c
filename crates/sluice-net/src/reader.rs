use crate::{
    descriptor::Descriptor,
    error::{RECV, map_io_error},
    socket::{SocketInner, TaskExit},
};
use sluice_io::{ByteChannel, ByteReadChannel, ByteWriteChannel, ChannelError};
use std::io;
use tracing::{debug, trace};

enum Received {
    Bytes(usize),
    Eof,
    WouldBlock,
}

/// 读适配循环：把套接字收到的字节搬进下游通道。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 下游通道未关闭时，直接在通道暂存区上执行非阻塞 `recv`；
/// 2. `n > 0`：提交并 `flush`，背压在此处挂起循环；`0`：对端有序关闭，结束循环；
///    would-block：在选择器上等待可读（同时监听下游终止）后重试；其他错误直接成为任务失败；
/// 3. 选择器端点被关闭视为干净停止；循环结束后若下游已记录关闭原因，该原因成为任务失败；
/// 4. 退出守卫负责半关闭读方向、关闭下游通道并通知生命周期协调者。
pub(crate) async fn run<D: Descriptor>(exit: TaskExit<D>) -> Result<(), ChannelError> {
    let result = read_loop(&exit.socket, &exit.channel).await;
    exit.finish(result.clone().err());
    result
}

async fn read_loop<D: Descriptor>(
    socket: &SocketInner<D>,
    channel: &ByteChannel,
) -> Result<(), ChannelError> {
    let chunk = socket.options.read_chunk_size();
    debug!(socket = socket.id(), "read adapter started");

    while !channel.is_closed_for_write() {
        let mut received = Received::WouldBlock;
        let committed = channel.write_with(chunk, |buf| loop {
            match socket.descriptor.recv(buf) {
                Ok(0) => {
                    received = Received::Eof;
                    return Ok(0);
                }
                Ok(count) => {
                    received = Received::Bytes(count);
                    return Ok(count);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(map_io_error(RECV, error)),
            }
        });
        if let Err(error) = committed {
            // 下游在检查之后才关闭：交给循环结束后的关闭原因检查。
            if error.is_transport() || !channel.is_closed_for_write() {
                return Err(error);
            }
            break;
        }

        match received {
            Received::Bytes(count) => {
                trace!(socket = socket.id(), bytes = count, "received");
                channel.flush().await?;
            }
            Received::Eof => {
                debug!(socket = socket.id(), "peer closed read half");
                break;
            }
            Received::WouldBlock => {
                if let Err(error) = socket.wait_readable(channel).await {
                    debug!(socket = socket.id(), %error, "read selection ended");
                    break;
                }
            }
        }
    }

    match channel.closed_cause() {
        Some(cause) => Err(cause),
        None => Ok(()),
    }
}

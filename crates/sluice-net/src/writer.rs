use crate::{
    descriptor::Descriptor,
    error::{SELECT, SEND, map_io_error},
    socket::{SocketInner, TaskExit},
};
use sluice_io::{ByteChannel, ByteReadChannel, ChannelError};
use std::io;
use tracing::{debug, trace};

/// 写适配循环：把上游通道发布的字节发送到套接字。
///
/// 上游正常关闭且数据全部发出后结束；上游以错误终止、发送失败或等待可写时端点被关闭，
/// 都会成为本方向的失败。部分发送只消费已发出的字节，剩余部分在下一轮重试。
pub(crate) async fn run<D: Descriptor>(exit: TaskExit<D>) -> Result<(), ChannelError> {
    let result = write_loop(&exit.socket, &exit.channel).await;
    exit.finish(result.clone().err());
    result
}

async fn write_loop<D: Descriptor>(
    socket: &SocketInner<D>,
    channel: &ByteChannel,
) -> Result<(), ChannelError> {
    debug!(socket = socket.id(), "write adapter started");

    while channel.await_content().await? {
        let mut would_block = false;
        let sent = channel.read_with(|bytes| loop {
            match socket.descriptor.send(bytes) {
                Ok(0) => return Err(map_io_error(SEND, io::ErrorKind::WriteZero.into())),
                Ok(count) => return Ok(count),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    would_block = true;
                    return Ok(0);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(map_io_error(SEND, error)),
            }
        })?;

        if would_block {
            socket
                .wait_writable(channel)
                .await
                .map_err(|error| map_io_error(SELECT, error.into_io()))?;
        } else {
            trace!(socket = socket.id(), bytes = sent, "sent");
        }
    }

    debug!(socket = socket.id(), "write adapter drained");
    Ok(())
}

use crate::error::{Cause, ChannelError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

/// 字节通道的读端契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层协议（HTTP 帧解析等）只依赖“等待内容 → 取走可读视图”这一最小交互，
///   无需关心数据来自内存通道还是直接来自套接字；
/// - 终止状态携带可选错误，调用方通过返回值而非异常感知失败。
///
/// ## 契约（What）
/// - `await_content`：若已设置关闭原因，立即返回该错误；若缓冲区有数据返回 `true`；
///   干净结束且缓冲区为空时返回 `false`；否则挂起，绝不忙等；
/// - `read_available`：取走至多 `max` 字节的只读视图，不会挂起；
/// - `cancel`：丢弃缓冲数据，并在尚未关闭时记录派生自 `cause` 的取消错误；
/// - `is_closed_for_read`：当且仅当已终止且缓冲区为空。
///
/// ## 注意事项（Trade-offs）
/// - 假定同一时刻只有一个消费者；多个任务并发调用 `await_content` 不受支持。
#[async_trait]
pub trait ByteReadChannel: Send + Sync {
    /// 当前记录的关闭原因；正常结束或仍在运行时为 `None`。
    fn closed_cause(&self) -> Option<ChannelError>;

    fn is_closed_for_read(&self) -> bool;

    /// 已可读取的字节数。
    fn available_for_read(&self) -> usize;

    /// 取走至多 `max` 字节。
    fn read_available(&self, max: usize) -> Bytes;

    /// 等待可读内容，语义见 trait 文档。
    async fn await_content(&self) -> Result<bool, ChannelError>;

    /// 以调用方原因取消读端。
    fn cancel(&self, cause: Cause);
}

/// 字节通道的写端契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 生产者先写入暂存区，再通过 `flush` 让数据对消费者可见，避免逐字节唤醒；
/// - 背压在 `flush` 处体现：已发布数据超过容量时挂起，直到消费者取走数据。
///
/// ## 契约（What）
/// - `write_fully`：暂存全部字节；暂存量达到容量时自动 `flush`；
/// - `flush`：发布暂存数据，并在已发布数据超过容量时挂起；
/// - `close`：发布剩余暂存数据后正常关闭（对应 flush-and-close）；
/// - `close_with_cause`：以错误终止，已缓冲数据不再可见；
/// - 已终止的通道上写入返回记录的错误，正常关闭则返回 `ClosedForWrite`。
#[async_trait]
pub trait ByteWriteChannel: Send + Sync {
    fn is_closed_for_write(&self) -> bool;

    async fn write_fully(&self, src: &[u8]) -> Result<(), ChannelError>;

    async fn flush(&self) -> Result<(), ChannelError>;

    fn close(&self);

    fn close_with_cause(&self, cause: ChannelError);
}

/// 读端的便捷操作，对所有 [`ByteReadChannel`] 自动可用。
#[async_trait]
pub trait ReadChannelExt: ByteReadChannel {
    /// 读取单个字节；上游结束时返回 `UnexpectedEof`。
    async fn read_byte(&self) -> Result<u8, ChannelError> {
        if !self.await_content().await? {
            return Err(ChannelError::unexpected_eof(1));
        }
        self.read_available(1)
            .first()
            .copied()
            .ok_or_else(|| ChannelError::unexpected_eof(1))
    }

    /// 填满 `dst`。
    async fn read_fully(&self, dst: &mut [u8]) -> Result<(), ChannelError> {
        let mut filled = 0;
        while filled < dst.len() {
            if !self.await_content().await? {
                return Err(ChannelError::unexpected_eof(dst.len() - filled));
            }
            let chunk = self.read_available(dst.len() - filled);
            dst[filled..filled + chunk.len()].copy_from_slice(&chunk);
            filled += chunk.len();
        }
        Ok(())
    }

    /// 读取直到上游结束。
    async fn read_remaining(&self) -> Result<Bytes, ChannelError> {
        self.read_remaining_limited(usize::MAX).await
    }

    /// 读取直到上游结束或累计达到 `limit` 字节。
    async fn read_remaining_limited(&self, limit: usize) -> Result<Bytes, ChannelError> {
        let mut collected = BytesMut::new();
        while collected.len() < limit && self.await_content().await? {
            let chunk = self.read_available(limit - collected.len());
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// 将本通道内容拷贝到 `destination`，参见 [`crate::copy::copy_to`]。
    async fn copy_to(&self, destination: &dyn ByteWriteChannel) -> Result<u64, ChannelError> {
        crate::copy::copy_to(self, destination).await
    }
}

impl<T: ByteReadChannel + ?Sized> ReadChannelExt for T {}

/// 写端的便捷操作。
#[async_trait]
pub trait WriteChannelExt: ByteWriteChannel {
    async fn write_byte(&self, byte: u8) -> Result<(), ChannelError> {
        self.write_fully(&[byte]).await
    }

    /// 等待发布完成后正常关闭。
    async fn flush_and_close(&self) -> Result<(), ChannelError> {
        self.flush().await?;
        self.close();
        Ok(())
    }
}

impl<T: ByteWriteChannel + ?Sized> WriteChannelExt for T {}

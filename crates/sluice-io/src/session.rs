use crate::{channel::ByteChannel, contract::ByteWriteChannel, error::ChannelError};
use bytes::BytesMut;

impl ByteChannel {
    /// 以“会话”方式持续生产数据。
    ///
    /// # 教案级注释
    ///
    /// ## 意图（Why）
    /// - 编码器往往希望直接向通道的暂存区追加数据，而不是先在自有缓冲里拼装再整体拷贝；
    /// - 每轮结束后立即 `flush`，让消费者尽早看到数据，同时在此处承受背压。
    ///
    /// ## 契约（What）
    /// - `block` 收到通道暂存区的可变引用，追加任意字节后返回是否继续；
    /// - 每轮之后执行一次 `flush`，返回 `false` 时在最后一次 `flush` 完成后结束；
    /// - 通道终止时返回记录的错误，`block` 不再被调用。
    ///
    /// ## 注意事项（Trade-offs）
    /// - `block` 在通道锁内执行，必须是短小的同步代码。
    pub async fn write_while<F>(&self, mut block: F) -> Result<(), ChannelError>
    where
        F: FnMut(&mut BytesMut) -> bool + Send,
    {
        loop {
            let more = {
                let mut state = self.shared.state.lock();
                if let Some(err) = state.write_error() {
                    return Err(err);
                }
                block(&mut state.staged)
            };
            self.flush().await?;
            if !more {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ReadChannelExt;
    use bytes::BufMut;

    #[tokio::test(flavor = "multi_thread")]
    async fn rounds_are_flushed_in_order() {
        let channel = ByteChannel::with_capacity(16);
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.read_remaining().await })
        };

        let mut round = 0u8;
        channel
            .write_while(|buf| {
                buf.put_slice(&[round; 10]);
                round += 1;
                round < 5
            })
            .await
            .expect("会话写入");
        channel.close();

        let data = reader.await.expect("join").expect("读取全部数据");
        assert_eq!(data.len(), 50);
        for (index, chunk) in data.chunks(10).enumerate() {
            assert!(chunk.iter().all(|byte| *byte as usize == index));
        }
    }

    #[tokio::test]
    async fn closed_channel_rejects_session() {
        let channel = ByteChannel::new();
        channel.close();
        let mut called = false;
        let err = channel
            .write_while(|_| {
                called = true;
                false
            })
            .await
            .expect_err("已关闭的通道不接受会话");
        assert!(!called);
        assert_eq!(err.code(), crate::error::codes::CLOSED_FOR_WRITE);
    }
}

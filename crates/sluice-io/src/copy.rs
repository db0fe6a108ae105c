use crate::{
    contract::{ByteReadChannel, ByteWriteChannel},
    error::ChannelError,
};
use std::sync::Arc;
use tracing::debug;

/// 拷贝时每次从源通道取走的最大字节数。
pub const COPY_CHUNK_SIZE: usize = 4096;

/// 将 `source` 的全部内容拷贝到 `destination`。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层经常需要把套接字读通道接到另一个通道（例如请求体转发），
///   拷贝过程必须保序、无丢失，并且每一块都及时对下游可见。
///
/// ## 逻辑（How）
/// 1. 等待源通道内容，取走至多 [`COPY_CHUNK_SIZE`] 字节；
/// 2. 写入下游并立即 `flush`，下游无需等待源结束即可读到已拷贝数据；
/// 3. 源正常结束时正常关闭下游。
///
/// ## 契约（What）
/// - 返回拷贝的字节数；
/// - 源失败：下游以同一错误实例关闭，并返回该错误；
/// - 下游失败（例如被取消）：以该错误取消源通道，并返回该错误。
pub async fn copy_to<R, W>(source: &R, destination: &W) -> Result<u64, ChannelError>
where
    R: ByteReadChannel + ?Sized,
    W: ByteWriteChannel + ?Sized,
{
    let mut copied = 0u64;
    loop {
        match source.await_content().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                destination.close_with_cause(err.clone());
                return Err(err);
            }
        }
        let chunk = source.read_available(COPY_CHUNK_SIZE);
        if let Err(err) = write_chunk(destination, &chunk).await {
            source.cancel(Arc::new(err.clone()));
            return Err(err);
        }
        copied += chunk.len() as u64;
    }
    destination.close();
    Ok(copied)
}

/// 将 `source` 的内容同时拷贝到两个下游。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 扇出场景（例如一边转发一边记录）要求两个下游收到完全相同的字节序列；
/// - 一个下游被取消不应拖垮另一个下游，也不应阻塞上游生产者。
///
/// ## 逻辑（How）
/// - 每块数据只从源读取一次，随后并发写入仍存活的下游；
/// - 写入失败的下游被移出扇出集合，拷贝继续服务另一个下游；
/// - 两个下游都失效时，以第一个下游错误取消源通道并返回该错误；
/// - 源失败时两个下游以同一错误实例关闭。
///
/// ## 契约（What）
/// - 返回从源读取的字节数；
/// - 两个下游之间不保证相对进度，但各自的字节序列与源一致。
///
/// ## 注意事项（Trade-offs）
/// - 每块数据需要两个下游都接收完毕才继续读取下一块；若消费者先读完一个下游再读另一个，
///   而数据量超过下游容量，拷贝会停在背压处。
pub async fn copy_to_both<R, A, B>(source: &R, first: &A, second: &B) -> Result<u64, ChannelError>
where
    R: ByteReadChannel + ?Sized,
    A: ByteWriteChannel + ?Sized,
    B: ByteWriteChannel + ?Sized,
{
    let mut first_failure = first
        .is_closed_for_write()
        .then(ChannelError::closed_for_write);
    let mut second_failure = second
        .is_closed_for_write()
        .then(ChannelError::closed_for_write);
    let mut copied = 0u64;

    loop {
        if let (Some(first_err), Some(_)) = (&first_failure, &second_failure) {
            let err = first_err.clone();
            source.cancel(Arc::new(err.clone()));
            return Err(err);
        }
        match source.await_content().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                first.close_with_cause(err.clone());
                second.close_with_cause(err.clone());
                return Err(err);
            }
        }
        let chunk = source.read_available(COPY_CHUNK_SIZE);
        let (first_result, second_result) = tokio::join!(
            write_if_alive(first_failure.is_none(), first, &chunk),
            write_if_alive(second_failure.is_none(), second, &chunk),
        );
        if let Err(err) = first_result {
            debug!(code = err.code(), "first fan-out destination dropped");
            first_failure = Some(err);
        }
        if let Err(err) = second_result {
            debug!(code = err.code(), "second fan-out destination dropped");
            second_failure = Some(err);
        }
        copied += chunk.len() as u64;
    }

    if first_failure.is_none() {
        first.close();
    }
    if second_failure.is_none() {
        second.close();
    }
    Ok(copied)
}

async fn write_chunk<W>(destination: &W, chunk: &[u8]) -> Result<(), ChannelError>
where
    W: ByteWriteChannel + ?Sized,
{
    destination.write_fully(chunk).await?;
    destination.flush().await
}

async fn write_if_alive<W>(alive: bool, destination: &W, chunk: &[u8]) -> Result<(), ChannelError>
where
    W: ByteWriteChannel + ?Sized,
{
    if alive {
        write_chunk(destination, chunk).await
    } else {
        Ok(())
    }
}

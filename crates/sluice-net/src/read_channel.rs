use crate::{
    descriptor::{Descriptor, shutdown_half},
    error::{RECV, SELECT, map_io_error},
    selector::SelectInterest,
    socket::SocketInner,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sluice_io::{ByteReadChannel, Cause, ChannelError};
use socket2::Socket;
use std::{fmt, io, net::Shutdown, sync::Arc};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct ReadState {
    buffer: BytesMut,
    finished: bool,
    cause: Option<ChannelError>,
}

enum Attempt {
    Ready(bool),
    WouldBlock,
}

/// 直接建立在描述符上的读通道，不经过后台适配任务。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 只需要顺序读取响应体的调用方没有必要再启动一个读任务和一个中间通道；
///   `await_content` 在调用方任务中直接执行 `recv`，would-block 时挂起在选择器上。
///
/// ## 契约（What）
/// - 创建时开启读兴趣；缓冲区无上限，直到调用方取走数据；
/// - 对端有序关闭后，剩余数据仍可读取，读完后 `await_content` 返回 `false`；
/// - `cancel`：丢弃缓冲、清除读兴趣、半关闭读方向，并且只在首次调用时记录取消原因；
///   挂起中的 `await_content` 会被唤醒并返回该原因。
pub struct SocketReadChannel<D: Descriptor = Socket> {
    socket: Arc<SocketInner<D>>,
    state: Mutex<ReadState>,
    cancelled: Notify,
}

impl<D: Descriptor> SocketReadChannel<D> {
    pub(crate) fn new(socket: Arc<SocketInner<D>>) -> Self {
        socket
            .selector
            .set_interest(&socket.selectable, SelectInterest::Read, true);
        Self {
            socket,
            state: Mutex::new(ReadState::default()),
            cancelled: Notify::new(),
        }
    }

    fn try_fill(&self) -> Result<Attempt, ChannelError> {
        let mut state = self.state.lock();
        if let Some(cause) = &state.cause {
            return Err(cause.clone());
        }
        if !state.buffer.is_empty() {
            return Ok(Attempt::Ready(true));
        }
        if state.finished {
            return Ok(Attempt::Ready(false));
        }
        let chunk = self.socket.options.read_chunk_size();
        state.buffer.resize(chunk, 0);
        loop {
            match self.socket.descriptor.recv(&mut state.buffer[..]) {
                Ok(count) => {
                    state.buffer.truncate(count);
                    if count == 0 {
                        state.finished = true;
                    }
                    return Ok(Attempt::Ready(count > 0));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    state.buffer.clear();
                    return Ok(Attempt::WouldBlock);
                }
                Err(error) => {
                    state.buffer.clear();
                    let error = map_io_error(RECV, error);
                    state.cause = Some(error.clone());
                    return Err(error);
                }
            }
        }
    }

    fn record_failure(&self, error: ChannelError) -> ChannelError {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.cause.get_or_insert(error).clone()
    }
}

#[async_trait]
impl<D: Descriptor> ByteReadChannel for SocketReadChannel<D> {
    fn closed_cause(&self) -> Option<ChannelError> {
        self.state.lock().cause.clone()
    }

    fn is_closed_for_read(&self) -> bool {
        let state = self.state.lock();
        (state.finished || state.cause.is_some()) && state.buffer.is_empty()
    }

    fn available_for_read(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn read_available(&self, max: usize) -> Bytes {
        let mut state = self.state.lock();
        let count = max.min(state.buffer.len());
        state.buffer.split_to(count).freeze()
    }

    async fn await_content(&self) -> Result<bool, ChannelError> {
        loop {
            match self.try_fill()? {
                Attempt::Ready(has_content) => return Ok(has_content),
                Attempt::WouldBlock => {}
            }
            let socket = &self.socket;
            tokio::select! {
                biased;
                () = self.cancelled.notified() => {}
                ready = socket.selector.select(&socket.selectable, SelectInterest::Read) => {
                    if let Err(error) = ready {
                        return Err(self.record_failure(map_io_error(SELECT, error.into_io())));
                    }
                }
            }
        }
    }

    fn cancel(&self, cause: Cause) {
        let first = {
            let mut state = self.state.lock();
            state.buffer.clear();
            let first = state.cause.is_none();
            if first {
                state.cause = Some(ChannelError::cancelled(cause));
            }
            first
        };
        self.socket
            .selector
            .set_interest(&self.socket.selectable, SelectInterest::Read, false);
        if let Err(error) = shutdown_half(&self.socket.descriptor, Shutdown::Read) {
            debug!(socket = self.socket.id(), %error, "read half close failed");
        }
        if first {
            debug!(socket = self.socket.id(), "socket read channel cancelled");
            self.cancelled.notify_one();
        }
    }
}

impl<D: Descriptor> fmt::Debug for SocketReadChannel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SocketReadChannel")
            .field("socket", &self.socket.id())
            .field("buffered", &state.buffer.len())
            .field("finished", &state.finished)
            .field("cause", &state.cause.as_ref().map(ChannelError::code))
            .finish()
    }
}

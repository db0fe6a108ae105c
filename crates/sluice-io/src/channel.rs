use crate::{
    contract::{ByteReadChannel, ByteWriteChannel},
    error::{Cause, ChannelError},
};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::Notify;
use tracing::trace;

/// 默认背压阈值：已发布但未被消费的数据超过该值时，`flush` 挂起生产者。
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// 终止状态；`cause` 为 `None` 表示正常结束。
#[derive(Clone, Debug)]
struct Closed {
    cause: Option<ChannelError>,
}

#[derive(Debug)]
pub(crate) struct State {
    /// 已发布、对消费者可见的数据。
    pub(crate) published: BytesMut,
    /// 已写入但尚未 `flush` 的数据。
    pub(crate) staged: BytesMut,
    closed: Option<Closed>,
}

impl State {
    /// 写入已终止通道时应返回的错误。
    pub(crate) fn write_error(&self) -> Option<ChannelError> {
        self.closed.as_ref().map(|closed| {
            closed
                .cause
                .clone()
                .unwrap_or_else(ChannelError::closed_for_write)
        })
    }

    fn cause(&self) -> Option<&ChannelError> {
        self.closed.as_ref().and_then(|closed| closed.cause.as_ref())
    }

    fn publish_staged(&mut self) -> bool {
        if self.staged.is_empty() {
            return false;
        }
        let staged = self.staged.split();
        self.published.unsplit(staged);
        true
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    capacity: usize,
    /// 消费者等待新内容。
    content: Notify,
    /// 生产者等待已发布数据被消费。
    space: Notify,
    /// 任意一方等待终止状态。
    terminated: Notify,
}

/// 单生产者/单消费者的可挂起字节通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在套接字适配循环与上层协议之间提供有界、保序的字节缓冲，
///   消费者慢时让生产者挂起（背压），缓冲为空时让消费者挂起；
/// - 通道终止时携带可选错误，错误一经设置便不可覆盖，之后所有读写都能观察到它。
///
/// ## 逻辑（How）
/// - 状态由 `parking_lot::Mutex` 保护，临界区内只做缓冲搬移，从不跨越 `.await`；
/// - 写入先进入 `staged`，`flush` 将其并入 `published` 并唤醒消费者；
/// - 三个 `Notify` 分别对应“有内容”“有空间”“已终止”三类等待，
///   `notify_one` 的许可语义保证检查状态与挂起之间不会丢失唤醒；
/// - `cancel`/`close_with_cause` 丢弃全部缓冲，保证取消后的数据不会被观察到。
///
/// ## 契约（What）
/// - 句柄可 `Clone`，克隆共享同一通道；读写两端分别假定只有一个使用者；
/// - `is_closed_for_read` 当且仅当已终止且已发布缓冲为空；
/// - 适配循环专用的 [`write_with`](Self::write_with)、[`read_with`](Self::read_with)
///   直接在通道缓冲上执行系统调用，避免额外拷贝。
///
/// ## 注意事项（Trade-offs）
/// - `write_with`/`read_with` 在持锁期间执行闭包，闭包必须是非阻塞的；
/// - 单次 `write_fully` 会按容量分块暂存，超大写入不会一次性占用无界内存。
#[derive(Clone)]
pub struct ByteChannel {
    pub(crate) shared: Arc<Shared>,
}

impl ByteChannel {
    /// 使用默认容量创建通道。
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// 使用指定背压阈值创建通道，阈值至少为 1 字节。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    published: BytesMut::new(),
                    staged: BytesMut::new(),
                    closed: None,
                }),
                capacity: capacity.max(1),
                content: Notify::new(),
                space: Notify::new(),
                terminated: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// 直接在通道暂存区中填充至少 `min` 字节的空间。
    ///
    /// `fill` 返回实际写入的字节数（可为 0），该部分被提交到暂存区，
    /// 需要随后调用 `flush` 才对消费者可见。通道已终止时不会调用 `fill`。
    pub fn write_with<F>(&self, min: usize, fill: F) -> Result<usize, ChannelError>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, ChannelError>,
    {
        let mut state = self.shared.state.lock();
        if let Some(err) = state.write_error() {
            return Err(err);
        }
        let start = state.staged.len();
        state.staged.resize(start + min, 0);
        match fill(&mut state.staged[start..]) {
            Ok(count) => {
                let count = count.min(min);
                state.staged.truncate(start + count);
                Ok(count)
            }
            Err(err) => {
                state.staged.truncate(start);
                Err(err)
            }
        }
    }

    /// 将已发布数据交给 `drain`，并消费其返回的字节数。
    ///
    /// 通道以错误终止时返回该错误且不调用 `drain`。
    pub fn read_with<F>(&self, drain: F) -> Result<usize, ChannelError>
    where
        F: FnOnce(&[u8]) -> Result<usize, ChannelError>,
    {
        let mut state = self.shared.state.lock();
        if let Some(cause) = state.cause() {
            return Err(cause.clone());
        }
        if state.published.is_empty() {
            return Ok(0);
        }
        let consumed = drain(&state.published[..])?.min(state.published.len());
        state.published.advance(consumed);
        drop(state);
        if consumed > 0 {
            self.shared.space.notify_one();
        }
        Ok(consumed)
    }

    /// 等待通道进入终止状态（正常关闭、以错误关闭或被取消）。
    ///
    /// 适配循环在等待套接字就绪时与该 Future 竞争，以便取消能唤醒挂起在选择器上的任务。
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.terminated.notified();
            if self.shared.state.lock().closed.is_some() {
                return;
            }
            notified.await;
        }
    }

    fn terminate(&self, closed: Closed) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed.is_some() {
                return false;
            }
            if closed.cause.is_some() {
                state.published.clear();
                state.staged.clear();
            } else {
                state.publish_staged();
            }
            state.closed = Some(closed);
        }
        self.shared.content.notify_one();
        self.shared.space.notify_one();
        self.shared.terminated.notify_waiters();
        true
    }
}

impl Default for ByteChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ByteChannel")
            .field("published", &state.published.len())
            .field("staged", &state.staged.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed.is_some())
            .field("cause", &state.cause().map(ChannelError::code))
            .finish()
    }
}

#[async_trait]
impl ByteReadChannel for ByteChannel {
    fn closed_cause(&self) -> Option<ChannelError> {
        self.shared.state.lock().cause().cloned()
    }

    fn is_closed_for_read(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed.is_some() && state.published.is_empty()
    }

    fn available_for_read(&self) -> usize {
        let state = self.shared.state.lock();
        if state.cause().is_some() {
            0
        } else {
            state.published.len()
        }
    }

    fn read_available(&self, max: usize) -> Bytes {
        let chunk = {
            let mut state = self.shared.state.lock();
            if state.cause().is_some() {
                return Bytes::new();
            }
            let count = max.min(state.published.len());
            state.published.split_to(count).freeze()
        };
        if !chunk.is_empty() {
            self.shared.space.notify_one();
        }
        chunk
    }

    async fn await_content(&self) -> Result<bool, ChannelError> {
        loop {
            {
                let state = self.shared.state.lock();
                if let Some(closed) = &state.closed {
                    return match &closed.cause {
                        Some(cause) => Err(cause.clone()),
                        None => Ok(!state.published.is_empty()),
                    };
                }
                if !state.published.is_empty() {
                    return Ok(true);
                }
            }
            self.shared.content.notified().await;
        }
    }

    fn cancel(&self, cause: Cause) {
        if self.terminate(Closed {
            cause: Some(ChannelError::cancelled(cause)),
        }) {
            trace!("byte channel cancelled");
        }
    }
}

#[async_trait]
impl ByteWriteChannel for ByteChannel {
    fn is_closed_for_write(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    async fn write_fully(&self, src: &[u8]) -> Result<(), ChannelError> {
        for chunk in src.chunks(self.shared.capacity) {
            let needs_flush = {
                let mut state = self.shared.state.lock();
                if let Some(err) = state.write_error() {
                    return Err(err);
                }
                state.staged.extend_from_slice(chunk);
                state.staged.len() >= self.shared.capacity
            };
            if needs_flush {
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ChannelError> {
        let published = {
            let mut state = self.shared.state.lock();
            if let Some(cause) = state.cause() {
                return Err(cause.clone());
            }
            state.publish_staged()
        };
        if published {
            self.shared.content.notify_one();
        }
        loop {
            {
                let state = self.shared.state.lock();
                if let Some(closed) = &state.closed {
                    return match &closed.cause {
                        Some(cause) => Err(cause.clone()),
                        None => Ok(()),
                    };
                }
                if state.published.len() <= self.shared.capacity {
                    return Ok(());
                }
            }
            self.shared.space.notified().await;
        }
    }

    fn close(&self) {
        if self.terminate(Closed { cause: None }) {
            trace!("byte channel closed");
        }
    }

    fn close_with_cause(&self, cause: ChannelError) {
        let code = cause.code();
        if self.terminate(Closed { cause: Some(cause) }) {
            trace!(code, "byte channel closed with cause");
        }
    }
}

use crate::{
    descriptor::{Descriptor, shutdown_half},
    error::{AdapterAborted, CLOSE, JOIN, SelectorError, SocketError, map_io_error},
    lifecycle::{Direction, Lifecycle, SocketFailure, StartError, combine},
    options::SocketOptions,
    read_channel::SocketReadChannel,
    reader,
    selector::{SelectInterest, Selectable, SelectorManager},
    writer,
};
use sluice_io::{ByteChannel, ByteReadChannel, ByteWriteChannel, ChannelError, cause};
use socket2::Socket;
use std::{
    fmt, io,
    net::{Shutdown, TcpStream},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    sync::Arc,
};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, warn};

type Outcome = Option<Result<(), SocketFailure>>;

pub(crate) struct SocketInner<D> {
    pub(crate) selectable: Selectable,
    pub(crate) selector: SelectorManager,
    pub(crate) descriptor: D,
    pub(crate) options: SocketOptions,
    handle: Handle,
    lifecycle: Lifecycle,
    outcome: watch::Sender<Outcome>,
}

impl<D: Descriptor> SocketInner<D> {
    pub(crate) fn id(&self) -> u64 {
        self.selectable.id()
    }

    fn claim(&self, direction: Direction) -> Result<(), SocketError> {
        if self.lifecycle.is_close_requested() {
            return Err(SocketError::Closed);
        }
        match self.lifecycle.start(direction) {
            Ok(()) => Ok(()),
            Err(StartError::AlreadyStarted) => Err(SocketError::AlreadyAttached { direction }),
            Err(StartError::Closing) => {
                self.check_completion();
                Err(SocketError::Closed)
            }
        }
    }

    fn complete(&self, direction: Direction, failure: Option<ChannelError>) {
        self.lifecycle.complete(direction, failure);
        self.check_completion();
    }

    /// 在关闭已请求且两个方向都结束时执行真正的关闭，并发布最终结果。
    ///
    /// 由每个适配任务结束时以及 `close()` 调用；状态机保证只有一个调用者执行关闭。
    fn check_completion(&self) {
        let Some(completion) = self.lifecycle.try_finish() else {
            return;
        };
        let close_failure = self.actual_close();
        let outcome = match combine([completion.reader, completion.writer, close_failure]) {
            None => {
                debug!(socket = self.id(), "socket closed");
                Ok(())
            }
            Some(failure) => {
                warn!(
                    socket = self.id(),
                    error = %failure.primary(),
                    suppressed = failure.suppressed().len(),
                    "socket closed with failure"
                );
                Err(failure)
            }
        };
        self.outcome.send_replace(Some(outcome));
    }

    fn actual_close(&self) -> Option<ChannelError> {
        self.selector.notify_closed(&self.selectable);
        self.descriptor
            .close()
            .err()
            .map(|error| map_io_error(CLOSE, error))
    }

    /// 等待可读，或等待下游通道终止。
    pub(crate) async fn wait_readable(&self, channel: &ByteChannel) -> Result<(), SelectorError> {
        tokio::select! {
            biased;
            () = channel.closed() => Ok(()),
            ready = self.selector.select(&self.selectable, SelectInterest::Read) => ready,
        }
    }

    /// 等待可写，或等待上游通道以错误终止。
    ///
    /// 正常关闭的上游仍可能留有待发送数据，因此只有带原因的终止才会打断等待。
    pub(crate) async fn wait_writable(&self, channel: &ByteChannel) -> Result<(), SelectorError> {
        let failed = async {
            channel.closed().await;
            if channel.closed_cause().is_none() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            biased;
            () = failed => Ok(()),
            ready = self.selector.select(&self.selectable, SelectInterest::Write) => ready,
        }
    }
}

impl<D> Drop for SocketInner<D> {
    fn drop(&mut self) {
        self.selector.notify_closed(&self.selectable);
    }
}

/// 适配任务的退出守卫：无论正常结束、出错还是任务被中止，都执行同一套收尾。
///
/// 收尾顺序：半关闭本方向、以失败关闭通道、记录任务结果、检查套接字完成条件。
/// 守卫作为任务 Future 的参数传入，任务在首次轮询前被中止时同样会触发收尾。
pub(crate) struct TaskExit<D: Descriptor> {
    pub(crate) socket: Arc<SocketInner<D>>,
    pub(crate) channel: ByteChannel,
    direction: Direction,
    failure: Option<Option<ChannelError>>,
    report: Arc<Mutex<Option<ChannelError>>>,
}

impl<D: Descriptor> TaskExit<D> {
    fn new(socket: Arc<SocketInner<D>>, channel: ByteChannel, direction: Direction) -> Self {
        Self {
            socket,
            channel,
            direction,
            failure: None,
            report: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn finish(mut self, failure: Option<ChannelError>) {
        self.failure = Some(failure);
    }
}

impl<D: Descriptor> Drop for TaskExit<D> {
    fn drop(&mut self) {
        let failure = self
            .failure
            .take()
            .unwrap_or_else(|| Some(ChannelError::cancelled(cause(AdapterAborted(self.direction)))));
        let half = match self.direction {
            Direction::Read => Shutdown::Read,
            Direction::Write => Shutdown::Write,
        };
        if let Err(error) = shutdown_half(&self.socket.descriptor, half) {
            debug!(socket = self.socket.id(), direction = %self.direction, %error, "half close failed");
        }
        match &failure {
            Some(error) => self.channel.close_with_cause(error.clone()),
            None => self.channel.close(),
        }
        debug!(
            socket = self.socket.id(),
            direction = %self.direction,
            failed = failure.is_some(),
            "adapter finished"
        );
        *self.report.lock() = failure.clone();
        self.socket.complete(self.direction, failure);
    }
}

/// 已挂载的适配任务句柄。
#[derive(Debug)]
pub struct AdapterJob {
    direction: Direction,
    handle: JoinHandle<Result<(), ChannelError>>,
    report: Arc<Mutex<Option<ChannelError>>>,
}

impl AdapterJob {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 中止任务；退出守卫仍会完成半关闭与结果记录。
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// 等待任务结束，返回该方向记录的失败。
    ///
    /// 任务被中止或 panic 时返回退出守卫记录的同一错误实例，与通道和套接字结果一致。
    pub async fn join(self) -> Result<(), ChannelError> {
        match self.handle.await {
            Ok(result) => result,
            Err(error) => {
                let recorded = self.report.lock().clone();
                Err(recorded.unwrap_or_else(|| map_io_error(JOIN, io::Error::other(error))))
            }
        }
    }
}

/// 非阻塞套接字：独占描述符，协调读、写适配任务与最终关闭。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读写两个方向由独立任务驱动，任何一方都可能先结束或失败；
///   描述符必须在两者都结束且调用方请求关闭之后才关闭，并且只关闭一次；
/// - 两个方向与关闭动作的失败需要合并为一个最终结果，供等待套接字完成的调用方观察。
///
/// ## 逻辑（How）
/// - [`attach_for_reading`](Self::attach_for_reading) / [`attach_for_writing`](Self::attach_for_writing)
///   在显式传入的运行时句柄上启动适配循环；
/// - 每个适配任务结束时经由退出守卫记录结果并检查完成条件；[`close`](Self::close)
///   只负责请求关闭并检查一次；
/// - 真正的关闭先注销选择器端点（清空兴趣），再释放描述符；
///   合并顺序为读失败、写失败、关闭失败。
///
/// ## 契约（What）
/// - `close()` 幂等：只有第一次调用会触发检查，之后的调用不改变已发布的结果；
/// - 同一方向只能挂载一次，关闭请求之后挂载返回 [`SocketError::Closed`]；
/// - 读适配任务在对端关闭或下游通道终止时结束，写适配任务在上游通道关闭并发送完毕后结束，
///   因此调用方通常先关闭写通道、取消读通道，再调用 `close()`。
pub struct NioSocket<D: Descriptor = Socket> {
    inner: Arc<SocketInner<D>>,
}

impl<D: Descriptor> Clone for NioSocket<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl NioSocket<Socket> {
    /// 接管已建立的 TCP 连接，并按配置设置 `TCP_NODELAY`。
    pub fn from_tcp(
        stream: TcpStream,
        selector: &SelectorManager,
        handle: Handle,
        options: SocketOptions,
    ) -> Result<Self, SocketError> {
        stream
            .set_nodelay(options.no_delay())
            .map_err(SocketError::Configure)?;
        Self::new(Socket::from(stream), selector, handle, options)
    }

    /// 接管 Unix 域流式套接字。
    pub fn from_unix(
        stream: UnixStream,
        selector: &SelectorManager,
        handle: Handle,
        options: SocketOptions,
    ) -> Result<Self, SocketError> {
        Self::new(Socket::from(stream), selector, handle, options)
    }
}

impl<D: Descriptor> NioSocket<D> {
    /// 切换为非阻塞、应用参数并注册到选择器。
    pub fn new(
        descriptor: D,
        selector: &SelectorManager,
        handle: Handle,
        options: SocketOptions,
    ) -> Result<Self, SocketError> {
        descriptor
            .set_nonblocking(true)
            .map_err(SocketError::Configure)?;
        descriptor
            .configure(&options)
            .map_err(SocketError::Configure)?;
        let selectable = selector.register(&descriptor)?;
        let (outcome, _) = watch::channel(None);
        debug!(socket = selectable.id(), fd = descriptor.as_raw_fd(), "socket opened");
        Ok(Self {
            inner: Arc::new(SocketInner {
                selectable,
                selector: selector.clone(),
                descriptor,
                options,
                handle,
                lifecycle: Lifecycle::new(),
                outcome,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn local_fd(&self) -> RawFd {
        self.inner.descriptor.as_raw_fd()
    }

    pub fn descriptor(&self) -> &D {
        &self.inner.descriptor
    }

    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    pub fn selectable(&self) -> &Selectable {
        &self.inner.selectable
    }

    /// 启动读适配循环，把套接字收到的字节写入 `channel`。
    pub fn attach_for_reading(&self, channel: ByteChannel) -> Result<AdapterJob, SocketError> {
        self.inner.claim(Direction::Read)?;
        let exit = TaskExit::new(Arc::clone(&self.inner), channel, Direction::Read);
        let report = Arc::clone(&exit.report);
        let handle = self.inner.handle.spawn(reader::run(exit));
        Ok(AdapterJob {
            direction: Direction::Read,
            handle,
            report,
        })
    }

    /// 启动写适配循环，把 `channel` 中发布的字节发送到套接字。
    pub fn attach_for_writing(&self, channel: ByteChannel) -> Result<AdapterJob, SocketError> {
        self.inner.claim(Direction::Write)?;
        let exit = TaskExit::new(Arc::clone(&self.inner), channel, Direction::Write);
        let report = Arc::clone(&exit.report);
        let handle = self.inner.handle.spawn(writer::run(exit));
        Ok(AdapterJob {
            direction: Direction::Write,
            handle,
            report,
        })
    }

    /// 打开直接建立在描述符上的读通道，占用读方向。
    ///
    /// 该通道不依赖后台任务，读方向立即被视为已结束，关闭时不会等待它。
    pub fn open_read_channel(&self) -> Result<SocketReadChannel<D>, SocketError> {
        self.inner.claim(Direction::Read)?;
        self.inner.complete(Direction::Read, None);
        Ok(SocketReadChannel::new(Arc::clone(&self.inner)))
    }

    /// 请求关闭；重复调用无副作用。
    pub fn close(&self) {
        if !self.inner.lifecycle.request_close() {
            return;
        }
        debug!(socket = self.id(), "socket close requested");
        self.inner.check_completion();
    }

    /// 描述符是否已完成关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    /// 已发布的最终结果；尚未完成时为 `None`。
    pub fn outcome(&self) -> Outcome {
        self.inner.outcome.borrow().clone()
    }

    /// 等待套接字完成并返回合并后的结果。
    pub async fn join(&self) -> Result<(), SocketFailure> {
        let mut outcome = self.inner.outcome.subscribe();
        // 发送端与 `self` 同生命周期，等待不会因发送端释放而失败。
        let published = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| (*value).clone());
        published.unwrap_or(Ok(()))
    }
}

impl<D: Descriptor> fmt::Debug for NioSocket<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NioSocket")
            .field("id", &self.id())
            .field("fd", &self.local_fd())
            .field("lifecycle", &self.inner.lifecycle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn close_publishes_outcome_and_logs_transition() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (local, _peer) = UnixStream::pair().expect("创建 socketpair");
        let socket = NioSocket::from_unix(local, &selector, Handle::current(), SocketOptions::default())
            .expect("构造套接字");
        assert!(socket.outcome().is_none());

        socket.close();
        assert!(matches!(socket.outcome(), Some(Ok(()))));
        assert!(socket.selectable().is_closed(), "关闭前注销端点");
        assert!(logs_contain("socket close requested"));
        assert!(logs_contain("socket closed"));
    }

    #[tokio::test]
    async fn open_read_channel_occupies_read_direction() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (local, _peer) = UnixStream::pair().expect("创建 socketpair");
        let socket = NioSocket::from_unix(local, &selector, Handle::current(), SocketOptions::default())
            .expect("构造套接字");

        let _channel = socket.open_read_channel().expect("打开直连读通道");
        assert!(socket.selectable().interest().contains(SelectInterest::Read));
        assert!(matches!(
            socket.attach_for_reading(ByteChannel::new()),
            Err(SocketError::AlreadyAttached {
                direction: Direction::Read
            })
        ));
    }
}

use crate::error::SelectorError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    fmt,
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};
use tokio::{
    io::{Interest, unix::AsyncFd},
    runtime::Handle,
    sync::Notify,
};
use tracing::{debug, trace};

/// 等待的就绪类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectInterest {
    Read,
    Write,
}

impl SelectInterest {
    pub const ALL: [SelectInterest; 2] = [SelectInterest::Read, SelectInterest::Write];

    const fn flag(self) -> u8 {
        match self {
            SelectInterest::Read => 0b01,
            SelectInterest::Write => 0b10,
        }
    }
}

/// 端点当前挂起的兴趣集合。
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const EMPTY: InterestSet = InterestSet(0);

    pub fn contains(self, interest: SelectInterest) -> bool {
        self.0 & interest.flag() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(
                SelectInterest::ALL
                    .iter()
                    .filter(|interest| self.contains(**interest)),
            )
            .finish()
    }
}

/// 不持有所有权的描述符句柄，仅用于向 Tokio 反应器注册。
///
/// 描述符本身由生命周期协调者独占，注册项总是先于描述符关闭被移除。
#[derive(Debug)]
struct RawDescriptor(RawFd);

impl AsRawFd for RawDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct EndpointInner {
    id: u64,
    fd: RawFd,
    registration: Mutex<Option<Arc<AsyncFd<RawDescriptor>>>>,
    interest: AtomicU8,
    closed: AtomicBool,
    close_notify: Notify,
}

/// 选择器上的一个注册端点：描述符、当前兴趣位与关闭通知。
///
/// 句柄可 `Clone`，克隆共享同一注册项。
#[derive(Clone)]
pub struct Selectable {
    inner: Arc<EndpointInner>,
}

impl Selectable {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// 当前挂起的兴趣位；只反映正在等待或显式开启的兴趣。
    pub fn interest(&self) -> InterestSet {
        InterestSet(self.inner.interest.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn set_flag(&self, interest: SelectInterest, enabled: bool) -> bool {
        let previous = if enabled {
            self.inner
                .interest
                .fetch_or(interest.flag(), Ordering::SeqCst)
        } else {
            self.inner
                .interest
                .fetch_and(!interest.flag(), Ordering::SeqCst)
        };
        previous & interest.flag() != 0
    }
}

impl fmt::Debug for Selectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selectable")
            .field("id", &self.inner.id)
            .field("fd", &self.inner.fd)
            .field("interest", &self.interest())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 等待期间置位兴趣，离开时（包括被取消）恢复。
///
/// 兴趣在进入前已被显式开启时保持不变。
struct PendingInterest<'a> {
    endpoint: &'a Selectable,
    interest: SelectInterest,
    owned: bool,
}

impl<'a> PendingInterest<'a> {
    fn set(endpoint: &'a Selectable, interest: SelectInterest) -> Self {
        let owned = !endpoint.set_flag(interest, true);
        Self {
            endpoint,
            interest,
            owned,
        }
    }
}

impl Drop for PendingInterest<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.endpoint.set_flag(self.interest, false);
        }
    }
}

struct ManagerInner {
    handle: Handle,
    endpoints: DashMap<u64, Selectable>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// 就绪选择器：多路复用大量描述符，让任务挂起直到描述符可读/可写或端点被关闭。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 适配循环遇到 would-block 时必须让出线程，而不是忙等或阻塞线程；
/// - 关闭套接字时，挂起在该端点上的等待者需要被立即唤醒并得到错误，
///   其他端点上的等待者不受影响。
///
/// ## 逻辑（How）
/// - 底层轮询委托给 Tokio 反应器：每个端点持有一个 `AsyncFd`，同时订阅读写就绪；
/// - 端点关闭通过每端点独立的 `Notify` 广播，`select` 在检查关闭标记之前先登记
///   唤醒，避免“检查后、挂起前”关闭造成的丢失唤醒；
/// - 就绪被消费后立即清除，下一次 would-block 会重新等待新的就绪事件。
///
/// ## 契约（What）
/// - [`register`](Self::register)：为描述符创建端点；选择器关闭后注册失败；
/// - [`select`](Self::select)：就绪返回 `Ok(())`，端点关闭返回 [`SelectorError::Closed`]；
/// - [`notify_closed`](Self::notify_closed)：注销端点、清空兴趣并唤醒全部等待者，幂等；
/// - [`close`](Self::close)：关闭全部端点。
///
/// ## 注意事项（Trade-offs）
/// - 同一描述符只能注册一次（epoll 不允许重复注册），读写两个方向共享同一端点。
#[derive(Clone)]
pub struct SelectorManager {
    inner: Arc<ManagerInner>,
}

impl SelectorManager {
    /// 基于指定运行时的反应器创建选择器。
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                handle,
                endpoints: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 基于当前运行时创建选择器；不在运行时上下文中时返回注册错误。
    pub fn current() -> Result<Self, SelectorError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|error| SelectorError::Registration(std::io::Error::other(error)))
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// 当前仍处于注册状态的端点数量。
    pub fn registered(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn register<S>(&self, source: &S) -> Result<Selectable, SelectorError>
    where
        S: AsRawFd + ?Sized,
    {
        if self.is_closed() {
            return Err(SelectorError::Closed);
        }
        let fd = source.as_raw_fd();
        let registration = {
            let _runtime = self.inner.handle.enter();
            AsyncFd::with_interest(RawDescriptor(fd), Interest::READABLE | Interest::WRITABLE)
                .map_err(SelectorError::Registration)?
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = Selectable {
            inner: Arc::new(EndpointInner {
                id,
                fd,
                registration: Mutex::new(Some(Arc::new(registration))),
                interest: AtomicU8::new(0),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        };
        self.inner.endpoints.insert(id, endpoint.clone());
        if self.is_closed() {
            self.notify_closed(&endpoint);
            return Err(SelectorError::Closed);
        }
        debug!(endpoint = id, fd, "selectable registered");
        Ok(endpoint)
    }

    /// 挂起直到端点对 `interest` 就绪，或端点被关闭。
    pub async fn select(
        &self,
        endpoint: &Selectable,
        interest: SelectInterest,
    ) -> Result<(), SelectorError> {
        let closed = endpoint.inner.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if endpoint.is_closed() {
            return Err(SelectorError::Closed);
        }
        let registration = endpoint
            .inner
            .registration
            .lock()
            .clone()
            .ok_or(SelectorError::Closed)?;
        let _pending = PendingInterest::set(endpoint, interest);
        trace!(endpoint = endpoint.id(), ?interest, "waiting for readiness");

        tokio::select! {
            biased;
            _ = &mut closed => Err(SelectorError::Closed),
            ready = wait_ready(&registration, interest) => ready,
        }
    }

    /// 显式开启或关闭端点的兴趣位。
    pub fn set_interest(&self, endpoint: &Selectable, interest: SelectInterest, enabled: bool) {
        endpoint.set_flag(interest, enabled);
    }

    /// 注销端点并以错误唤醒所有等待者；重复调用无副作用。
    pub fn notify_closed(&self, endpoint: &Selectable) {
        if endpoint.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        endpoint.inner.interest.store(0, Ordering::SeqCst);
        let registration = endpoint.inner.registration.lock().take();
        drop(registration);
        endpoint.inner.close_notify.notify_waiters();
        self.inner.endpoints.remove(&endpoint.inner.id);
        debug!(endpoint = endpoint.id(), "selectable closed");
    }

    /// 关闭选择器：注销全部端点，此后的注册直接失败。
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoints: Vec<Selectable> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for endpoint in &endpoints {
            self.notify_closed(endpoint);
        }
        debug!(endpoints = endpoints.len(), "selector closed");
    }
}

impl fmt::Debug for SelectorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorManager")
            .field("registered", &self.registered())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn wait_ready(
    registration: &AsyncFd<RawDescriptor>,
    interest: SelectInterest,
) -> Result<(), SelectorError> {
    match interest {
        SelectInterest::Read => {
            let mut guard = registration.readable().await.map_err(SelectorError::Wait)?;
            guard.clear_ready();
        }
        SelectInterest::Write => {
            let mut guard = registration.writable().await.map_err(SelectorError::Wait)?;
            guard.clear_ready();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::unix::net::UnixStream, time::Duration};
    use tokio::time::timeout;

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (left, right) = UnixStream::pair().expect("创建 socketpair");
        left.set_nonblocking(true).expect("非阻塞");
        right.set_nonblocking(true).expect("非阻塞");
        (left, right)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn select_resolves_when_readable() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (left, mut right) = nonblocking_pair();
        let endpoint = selector.register(&left).expect("注册");

        let waiter = {
            let (selector, endpoint) = (selector.clone(), endpoint.clone());
            tokio::spawn(async move { selector.select(&endpoint, SelectInterest::Read).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(endpoint.interest().contains(SelectInterest::Read), "等待期间兴趣置位");

        right.write_all(b"x").expect("写入对端");
        timeout(Duration::from_secs(5), waiter)
            .await
            .expect("及时就绪")
            .expect("join")
            .expect("就绪");
        assert!(endpoint.interest().is_empty(), "等待结束后兴趣被清除");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notify_closed_wakes_waiter_with_error() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (left, _right) = nonblocking_pair();
        let endpoint = selector.register(&left).expect("注册");
        assert_eq!(selector.registered(), 1);

        let waiter = {
            let (selector, endpoint) = (selector.clone(), endpoint.clone());
            tokio::spawn(async move { selector.select(&endpoint, SelectInterest::Read).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        selector.notify_closed(&endpoint);
        selector.notify_closed(&endpoint);

        let result = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("关闭唤醒等待者")
            .expect("join");
        assert!(matches!(result, Err(SelectorError::Closed)));
        assert_eq!(selector.registered(), 0);
        assert!(endpoint.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn explicit_interest_survives_select() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (left, _right) = nonblocking_pair();
        let endpoint = selector.register(&left).expect("注册");

        selector.set_interest(&endpoint, SelectInterest::Read, true);
        selector
            .select(&endpoint, SelectInterest::Write)
            .await
            .expect("空缓冲可写");
        assert!(endpoint.interest().contains(SelectInterest::Read));
        assert!(!endpoint.interest().contains(SelectInterest::Write));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_selector_rejects_registration() {
        let selector = SelectorManager::current().expect("运行时上下文");
        let (left, right) = nonblocking_pair();
        let endpoint = selector.register(&left).expect("注册");
        selector.close();

        assert!(endpoint.is_closed());
        assert!(matches!(selector.register(&right), Err(SelectorError::Closed)));
        assert!(matches!(
            selector.select(&endpoint, SelectInterest::Write).await,
            Err(SelectorError::Closed)
        ));
    }
}

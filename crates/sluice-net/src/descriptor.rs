use crate::options::SocketOptions;
use socket2::Socket;
use std::{
    io::{self, Read},
    net::Shutdown,
    os::fd::AsRawFd,
};

/// 适配循环与生命周期协调者所依赖的非阻塞描述符契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 适配循环只需要“收、发、半关闭”三个系统调用，抽象成 trait 后可以在测试中
///   包装真实套接字统计关闭次数，而无需 mock 整个操作系统；
/// - 描述符由生命周期协调者独占，其他组件只在单次 IO 期间借用。
///
/// ## 契约（What）
/// - `recv`：返回 `Ok(0)` 表示对端有序关闭，`WouldBlock` 表示需要等待就绪；
/// - `send`：返回实际发送的字节数，部分发送由调用方重试剩余部分；
/// - `close`：释放描述符的两个方向，并报告内核挂起的错误（`SO_ERROR`）；
///   协调者保证它只被调用一次。
pub trait Descriptor: AsRawFd + Send + Sync + 'static {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// 应用套接字参数；默认实现忽略全部参数。
    fn configure(&self, options: &SocketOptions) -> io::Result<()> {
        let _ = options;
        Ok(())
    }

    fn close(&self) -> io::Result<()>;
}

impl Descriptor for Socket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self;
        socket.read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Socket::send(self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        Socket::shutdown(self, how)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Socket::set_nonblocking(self, nonblocking)
    }

    fn configure(&self, options: &SocketOptions) -> io::Result<()> {
        if let Some(size) = options.send_buffer_size() {
            self.set_send_buffer_size(size)?;
        }
        if let Some(size) = options.receive_buffer_size() {
            self.set_recv_buffer_size(size)?;
        }
        if let Some(enabled) = options.keep_alive() {
            self.set_keepalive(enabled)?;
        }
        if options.linger().is_some() {
            self.set_linger(options.linger())?;
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        match Socket::shutdown(self, Shutdown::Both) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotConnected => {}
            Err(error) => return Err(error),
        }
        match self.take_error()? {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// 半关闭一个方向；对端已断开时的 `NotConnected` 视为成功。
pub(crate) fn shutdown_half<D: Descriptor + ?Sized>(descriptor: &D, how: Shutdown) -> io::Result<()> {
    match descriptor.shutdown(how) {
        Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Socket, Socket) {
        let (left, right) = UnixStream::pair().expect("创建 socketpair");
        (Socket::from(left), Socket::from(right))
    }

    #[test]
    fn nonblocking_recv_reports_would_block() {
        let (left, _right) = pair();
        Descriptor::set_nonblocking(&left, true).expect("切换非阻塞");
        let mut buf = [0u8; 8];
        let err = Descriptor::recv(&left, &mut buf).expect_err("无数据可读");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn send_then_recv_round_trip() {
        let (left, right) = pair();
        assert_eq!(Descriptor::send(&left, b"ping").expect("发送"), 4);
        let mut buf = [0u8; 8];
        let count = Descriptor::recv(&right, &mut buf).expect("接收");
        assert_eq!(&buf[..count], b"ping");
    }

    #[test]
    fn close_signals_orderly_end_to_peer() {
        let (left, right) = pair();
        Descriptor::close(&left).expect("关闭");
        let mut buf = [0u8; 8];
        assert_eq!(Descriptor::recv(&right, &mut buf).expect("读到 EOF"), 0);
    }
}

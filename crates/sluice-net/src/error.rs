use crate::lifecycle::Direction;
use sluice_io::ChannelError;
use std::io;
use thiserror::Error;
use tracing::debug;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RECV: OperationKind = OperationKind {
    code: "sluice.net.recv_failed",
    message: "socket recv",
};
pub(crate) const SEND: OperationKind = OperationKind {
    code: "sluice.net.send_failed",
    message: "socket send",
};
pub(crate) const SELECT: OperationKind = OperationKind {
    code: "sluice.net.select_failed",
    message: "socket select",
};
pub(crate) const CLOSE: OperationKind = OperationKind {
    code: "sluice.net.close_failed",
    message: "socket close",
};
pub(crate) const JOIN: OperationKind = OperationKind {
    code: "sluice.net.join_failed",
    message: "adapter join",
};

/// 将 IO 错误映射为通道层的传输错误，并以稳定错误码记录一次调试日志。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ChannelError {
    debug!(code = kind.code, error = %error, "{} failed", kind.message);
    ChannelError::transport(kind.message, error)
}

/// 就绪选择器返回的错误。
#[derive(Debug, Error)]
pub enum SelectorError {
    /// 端点已注销（套接字关闭或选择器整体关闭），等待者被唤醒。
    #[error("selector endpoint is closed")]
    Closed,
    #[error("failed to register descriptor with the reactor: {0}")]
    Registration(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

impl SelectorError {
    /// 转换为 IO 错误，供适配循环记录为传输失败。
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            SelectorError::Registration(error) | SelectorError::Wait(error) => error,
            SelectorError::Closed => {
                io::Error::new(io::ErrorKind::NotConnected, "selector endpoint is closed")
            }
        }
    }
}

/// 适配任务在结束前被中止（例如所属运行时关闭）。
#[derive(Debug, Error)]
#[error("{0} adapter task was aborted")]
pub(crate) struct AdapterAborted(pub Direction);

/// 套接字构造与适配器挂载阶段的错误。
#[derive(Debug, Error)]
pub enum SocketError {
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("{direction} adapter is already attached")]
    AlreadyAttached { direction: Direction },
    #[error("socket is closed")]
    Closed,
    #[error("failed to configure descriptor: {0}")]
    Configure(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_closure_maps_to_not_connected() {
        let error = SelectorError::Closed.into_io();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn mapped_errors_are_transport_flavored() {
        let error = map_io_error(SEND, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(error.is_transport());
        assert!(error.to_string().starts_with("socket send failed"));
    }
}

use std::{error::Error as StdError, io, sync::Arc};
use thiserror::Error;

/// 取消或关闭通道时携带的调用方原因。
///
/// 以 `Arc` 共享，保证同一个原因可以同时挂在通道、任务结果与合并失败上。
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// 将任意错误包装为 [`Cause`]。
pub fn cause<E>(error: E) -> Cause
where
    E: StdError + Send + Sync + 'static,
{
    Arc::new(error)
}

/// 通道错误的稳定错误码，遵循 `<域>.<语义>` 约定。
pub mod codes {
    pub const CANCELLED: &str = "sluice.io.cancelled";
    pub const CLOSED: &str = "sluice.io.closed";
    pub const TRANSPORT: &str = "sluice.io.transport";
    pub const CLOSED_FOR_WRITE: &str = "sluice.io.closed_for_write";
    pub const UNEXPECTED_EOF: &str = "sluice.io.unexpected_eof";
}

/// 通道终止原因的分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调用方需要区分“本地主动取消”“底层传输失败”“对端提前结束”等情形，
///   以便上层决定重试、降级或直接向用户报告；
/// - 取消被视为携带用户原因的传输错误，因此单独保留 `Cancelled` 分支。
///
/// ## 契约（What）
/// - `Cancelled`：通过 `cancel(cause)` 终止，`source()` 指向调用方原因；
/// - `Closed`：生产者以 `close_with_cause` 终止并提供原因；
/// - `Transport`：系统调用失败（would-block 与 EOF 永远不会落入此分支）；
/// - `ClosedForWrite`：向已正常关闭的通道写入；
/// - `UnexpectedEof`：读取固定长度数据时上游提前结束。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelErrorKind {
    #[error("channel was cancelled")]
    Cancelled {
        #[source]
        cause: Cause,
    },
    #[error("channel was closed with an error")]
    Closed {
        #[source]
        cause: Cause,
    },
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("channel is closed for write")]
    ClosedForWrite,
    #[error("unexpected end of stream: {missing} more bytes expected")]
    UnexpectedEof { missing: usize },
}

/// 字节通道与套接字适配层共享的错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 通道一旦以错误关闭，该错误需要被存储并原样交给之后每一个读/写调用者，
///   也要记录在适配任务结果中，最终参与套接字失败合并；
/// - 合并策略依赖“是否为同一个错误实例”的判定，因此错误本体以 `Arc` 共享，
///   克隆只增加引用计数，实例身份保持不变。
///
/// ## 逻辑（How）
/// - 内部持有 `Arc<ChannelErrorKind>`，`Display` 与 `source()` 透明转发；
/// - [`same_instance`](Self::same_instance) 通过指针比较判定身份；
/// - [`code`](Self::code) 返回稳定错误码，便于日志与指标聚合。
///
/// ## 注意事项（Trade-offs）
/// - 两个内容相同但分别构造的错误不是同一实例，合并时会作为次要原因保留。
#[derive(Clone, Debug, Error)]
#[error(transparent)]
pub struct ChannelError(Arc<ChannelErrorKind>);

impl ChannelError {
    /// 以调用方原因构造取消错误。
    pub fn cancelled(cause: Cause) -> Self {
        ChannelErrorKind::Cancelled { cause }.into()
    }

    /// 以调用方原因构造关闭错误。
    pub fn closed(cause: Cause) -> Self {
        ChannelErrorKind::Closed { cause }.into()
    }

    /// 将系统调用失败映射为传输错误。
    pub fn transport(operation: &'static str, source: io::Error) -> Self {
        ChannelErrorKind::Transport { operation, source }.into()
    }

    pub fn closed_for_write() -> Self {
        ChannelErrorKind::ClosedForWrite.into()
    }

    pub fn unexpected_eof(missing: usize) -> Self {
        ChannelErrorKind::UnexpectedEof { missing }.into()
    }

    /// 返回错误分类。
    pub fn kind(&self) -> &ChannelErrorKind {
        &self.0
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ChannelErrorKind::Cancelled { .. } => codes::CANCELLED,
            ChannelErrorKind::Closed { .. } => codes::CLOSED,
            ChannelErrorKind::Transport { .. } => codes::TRANSPORT,
            ChannelErrorKind::ClosedForWrite => codes::CLOSED_FOR_WRITE,
            ChannelErrorKind::UnexpectedEof { .. } => codes::UNEXPECTED_EOF,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ChannelErrorKind::Cancelled { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind(), ChannelErrorKind::Transport { .. })
    }

    /// 判断两个错误是否为同一实例（克隆视为同一实例）。
    pub fn same_instance(&self, other: &ChannelError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// 沿 `source()` 链查找第一个类型为 `E` 的错误。
    ///
    /// 用于确认失败是否由某个取消原因引起，例如下游读取失败能否追溯到上游的取消。
    pub fn caused_by<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        let mut current: Option<&(dyn StdError + 'static)> = self.0.source();
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            // `Cause` 作为 source 暴露时是 `Arc` 本身，需要先解开才能看到调用方错误。
            if let Some(shared) = err.downcast_ref::<Cause>() {
                current = Some(shared.as_ref());
                continue;
            }
            current = err.source();
        }
        None
    }
}

impl From<ChannelErrorKind> for ChannelError {
    fn from(kind: ChannelErrorKind) -> Self {
        Self(Arc::new(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity_but_fresh_errors_do_not() {
        let original = ChannelError::closed_for_write();
        let cloned = original.clone();
        let other = ChannelError::closed_for_write();

        assert!(original.same_instance(&cloned));
        assert!(!original.same_instance(&other));
    }

    #[test]
    fn cancellation_cause_is_reachable_through_source_chain() {
        let reason = io::Error::other("expected reason");
        let err = ChannelError::cancelled(cause(reason));

        assert!(err.is_cancelled());
        assert_eq!(err.code(), codes::CANCELLED);
        let found = err.caused_by::<io::Error>().expect("取消原因应出现在错误链中");
        assert_eq!(found.to_string(), "expected reason");
    }

    #[test]
    fn transport_error_keeps_operation_in_message() {
        let err = ChannelError::transport(
            "recv",
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        assert!(err.is_transport());
        assert!(err.to_string().starts_with("recv failed"));
    }
}

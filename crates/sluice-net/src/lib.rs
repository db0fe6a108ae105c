#![cfg(unix)]
#![deny(unsafe_code)]
#![doc = r#"
# sluice-net

## 设计动机（Why）
- **定位**：位于 HTTP 客户端/服务端之下的非阻塞套接字传输核心。把原始描述符的
  就绪事件与系统调用结果翻译为 `sluice-io` 字节通道上的填充与排空操作。
- **架构角色**：[`NioSocket`] 独占描述符并充当生命周期协调者；读、写两个适配循环
  各自运行在调用方提供的运行时上，通过 [`SelectorManager`] 等待就绪；
  双方结束后由协调者恰好一次地关闭描述符并合并失败。

## 核心契约（What）
- would-block 不是错误：适配循环在选择器上挂起后重试；
- 对端有序关闭（`recv` 返回 0）不是错误：读通道以 `false` 告知结束；
- 传输错误只终结所属方向，并记录在通道与任务结果中；
- 套接字最终结果 = 合并(读失败, 写失败, 关闭失败)，见 [`combine`]。

## 实现策略（How）
- 选择器委托 Tokio 反应器（`AsyncFd`）完成底层轮询，端点关闭通过 `Notify` 广播；
- 生命周期状态机 [`Lifecycle`] 以原子 CAS 实现 `OPEN → CLOSING → CLOSED`，
  可在 `--cfg sluice_loom` 下由 Loom 做模型检查；
- 描述符操作经由 [`Descriptor`] 契约，默认实现基于 `socket2::Socket`。

## 风险与考量（Trade-offs）
- 仅支持 Unix 平台；同一描述符只能注册一次，读写方向共享同一端点。
- `close()` 只请求关闭，不会主动终止仍在运行的适配循环；调用方需先关闭写通道、
  取消读通道，或等待对端关闭。
"#]

mod descriptor;
mod error;
mod lifecycle;
mod options;
mod read_channel;
mod reader;
mod selector;
mod socket;
mod writer;

pub use descriptor::Descriptor;
pub use error::{SelectorError, SocketError};
pub use lifecycle::{Completion, Direction, Lifecycle, SocketFailure, StartError, combine};
pub use options::{DEFAULT_READ_CHUNK_SIZE, OptionsError, SocketOptions};
pub use read_channel::SocketReadChannel;
pub use selector::{InterestSet, SelectInterest, Selectable, SelectorManager};
pub use socket::{AdapterJob, NioSocket};

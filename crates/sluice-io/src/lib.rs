#![deny(unsafe_code)]
#![doc = r#"
# sluice-io

## 设计动机（Why）
- **定位**：提供套接字传输核心使用的可挂起字节通道。生产者与消费者各自运行在
  协作式任务中，缓冲满时挂起生产者，缓冲空时挂起消费者，任何一方都不会阻塞线程。
- **架构角色**：`sluice-net` 的读/写适配循环把系统调用结果填入或取出本 crate 的
  [`ByteChannel`]；上层协议只依赖 [`ByteReadChannel`] / [`ByteWriteChannel`] 契约。
- **设计理念**：终止状态是携带可选错误的显式状态，而不是跨挂起点抛出的控制流；
  错误一经记录便不可覆盖，之后的每个调用者都会拿到同一个错误实例。

## 核心契约（What）
- [`ByteReadChannel::await_content`]：有数据返回 `true`，干净结束返回 `false`，
  已记录关闭原因时立即返回该错误；
- [`ByteWriteChannel::flush`]：让暂存数据对消费者可见，并在已发布数据超过容量时挂起；
- [`copy_to`] / [`copy_to_both`]：保序拷贝与双路扇出，取消沿拷贝链路传播。

## 实现策略（How）
- 通道状态由 `parking_lot::Mutex` 保护，等待通过 `tokio::sync::Notify` 完成；
- 存储使用 `bytes::BytesMut`，读取返回零拷贝的 `Bytes` 视图；
- 错误类型 [`ChannelError`] 以 `Arc` 共享，克隆保持实例身份，供失败合并判定。

## 风险与考量（Trade-offs）
- 每个方向假定单生产者、单消费者；多个消费者并发读取同一通道不受支持。
- 扇出拷贝按块同步推进两个下游，慢消费者会拖慢另一个下游但不会破坏其数据。
"#]

mod channel;
pub mod contract;
pub mod copy;
pub mod error;
mod session;

pub use channel::{ByteChannel, DEFAULT_CAPACITY};
pub use contract::{ByteReadChannel, ByteWriteChannel, ReadChannelExt, WriteChannelExt};
pub use copy::{COPY_CHUNK_SIZE, copy_to, copy_to_both};
pub use error::{Cause, ChannelError, ChannelErrorKind, cause};

//! 套接字生命周期状态机与失败合并。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 读、写两个适配任务独立结束，而描述符只能在两者都结束且调用方请求关闭后
//!   被关闭一次；状态机把这一条件集中到一个可单独做模型检查的类型里；
//! - 两个方向与关闭动作可能分别失败，最终结果需要保留全部诊断信息。
//!
//! ## 逻辑（How）
//! - 套接字状态 `OPEN → CLOSING → CLOSED` 存放在单个 `AtomicU8` 中，
//!   `CLOSING → CLOSED` 的 CAS 保证最终化只发生一次；
//! - 每个方向一个 [`TaskSlot`]：`NOT_STARTED | RUNNING | DONE`，失败在置为 `DONE`
//!   之前写入槽位，读取方观察到 `DONE` 时必然能看到失败；
//! - 启动任务与请求关闭使用顺序一致性原子操作构成 Dekker 式握手：
//!   要么启动方看到 `CLOSING` 并自行撤回，要么最终化方看到 `RUNNING` 并等待任务结束。
//!
//! ## 注意事项（Trade-offs）
//! - 以 `--cfg sluice_loom` 编译时切换到 Loom 的原子与互斥类型，供
//!   `tests/loom_lifecycle.rs` 穷举调度交错。

use sluice_io::ChannelError;
use std::{fmt, sync::PoisonError};
use thiserror::Error;

#[cfg(not(any(loom, sluice_loom)))]
use std::sync::{
    Mutex,
    atomic::{AtomicU8, Ordering},
};

#[cfg(any(loom, sluice_loom))]
use loom::sync::{
    Mutex,
    atomic::{AtomicU8, Ordering},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// 适配任务的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// 启动适配任务失败的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartError {
    /// 该方向已有任务启动过。
    AlreadyStarted,
    /// 关闭已被请求；槽位被直接标记为结束，调用方需随后检查完成条件。
    Closing,
}

struct TaskSlot {
    state: AtomicU8,
    failure: Mutex<Option<ChannelError>>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_STARTED),
            failure: Mutex::new(None),
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    fn take_failure(&self) -> Option<ChannelError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// 两个方向的最终失败，由 [`Lifecycle::try_finish`] 恰好交出一次。
#[derive(Debug, Default)]
pub struct Completion {
    pub reader: Option<ChannelError>,
    pub writer: Option<ChannelError>,
}

/// 套接字生命周期状态机。
pub struct Lifecycle {
    state: AtomicU8,
    reader: TaskSlot,
    writer: TaskSlot,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            reader: TaskSlot::new(),
            writer: TaskSlot::new(),
        }
    }

    fn slot(&self, direction: Direction) -> &TaskSlot {
        match direction {
            Direction::Read => &self.reader,
            Direction::Write => &self.writer,
        }
    }

    /// 请求关闭；只有第一个调用者得到 `true`。
    pub fn request_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_close_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) != OPEN
    }

    /// 描述符是否已完成关闭。
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    /// 将某方向标记为运行中。
    ///
    /// 返回 [`StartError::Closing`] 时槽位已被标记为结束，调用方必须随后调用
    /// [`try_finish`](Self::try_finish)，否则并发的关闭可能错过最终化时机。
    pub fn start(&self, direction: Direction) -> Result<(), StartError> {
        let slot = self.slot(direction);
        if slot
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StartError::AlreadyStarted);
        }
        if self.state.load(Ordering::SeqCst) != OPEN {
            slot.state.store(DONE, Ordering::SeqCst);
            return Err(StartError::Closing);
        }
        Ok(())
    }

    /// 记录某方向的结束结果；仅由该方向的任务调用一次。
    pub fn complete(&self, direction: Direction, failure: Option<ChannelError>) {
        let slot = self.slot(direction);
        *slot.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
        slot.state.store(DONE, Ordering::SeqCst);
    }

    /// 关闭已请求且两个方向都处于终止态（未启动或已结束）时，恰好一次返回两方向的失败。
    pub fn try_finish(&self) -> Option<Completion> {
        if self.state.load(Ordering::SeqCst) != CLOSING {
            return None;
        }
        if !self.reader.is_terminal() || !self.writer.is_terminal() {
            return None;
        }
        self.state
            .compare_exchange(CLOSING, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Completion {
            reader: self.reader.take_failure(),
            writer: self.writer.take_failure(),
        })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state.load(Ordering::SeqCst))
            .field("reader", &self.reader.state.load(Ordering::SeqCst))
            .field("writer", &self.writer.state.load(Ordering::SeqCst))
            .finish()
    }
}

/// 套接字最终失败：一个主因加上按发生顺序排列的次要原因。
///
/// 次要原因对应其他方向或关闭动作的独立失败，不会因为合并而丢失。
#[derive(Clone, Debug, Error)]
#[error("{primary} ({} suppressed)", .suppressed.len())]
pub struct SocketFailure {
    #[source]
    primary: ChannelError,
    suppressed: Vec<ChannelError>,
}

impl SocketFailure {
    pub fn new(primary: ChannelError) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    pub fn primary(&self) -> &ChannelError {
        &self.primary
    }

    pub fn suppressed(&self) -> &[ChannelError] {
        &self.suppressed
    }

    /// 是否已经以主因或次要原因的身份携带 `error` 这一实例。
    pub fn contains(&self, error: &ChannelError) -> bool {
        self.primary.same_instance(error)
            || self.suppressed.iter().any(|known| known.same_instance(error))
    }

    fn suppress(mut self, error: ChannelError) -> Self {
        if !self.contains(&error) {
            self.suppressed.push(error);
        }
        self
    }
}

/// 按从左到右的顺序合并失败。
///
/// - `None, None → None`；`None, X → X`；`X, None → X`；
/// - 同一实例只保留一次；
/// - 不同实例时，先出现者为主因，后出现者记为次要原因。
pub fn combine<I>(failures: I) -> Option<SocketFailure>
where
    I: IntoIterator<Item = Option<ChannelError>>,
{
    failures
        .into_iter()
        .flatten()
        .fold(None, |combined, error| match combined {
            None => Some(SocketFailure::new(error)),
            Some(failure) => Some(failure.suppress(error)),
        })
}

#[cfg(all(test, not(any(loom, sluice_loom))))]
mod tests {
    use super::*;
    use std::io;

    fn transport(message: &str) -> ChannelError {
        ChannelError::transport("socket recv", io::Error::other(message.to_owned()))
    }

    #[test]
    fn combine_keeps_first_as_primary() {
        let a = transport("a");
        let b = transport("b");
        let failure = combine([Some(a.clone()), Some(b.clone()), None]).expect("存在失败");
        assert!(failure.primary().same_instance(&a));
        assert_eq!(failure.suppressed().len(), 1);
        assert!(failure.suppressed()[0].same_instance(&b));
    }

    #[test]
    fn combine_collapses_same_instance() {
        let a = transport("a");
        let failure = combine([Some(a.clone()), Some(a.clone()), Some(a.clone())]).expect("存在失败");
        assert!(failure.primary().same_instance(&a));
        assert!(failure.suppressed().is_empty());
    }

    #[test]
    fn combine_of_nothing_is_success() {
        assert!(combine([None, None, None]).is_none());
        let b = transport("b");
        let failure = combine([None, Some(b.clone()), None]).expect("存在失败");
        assert!(failure.primary().same_instance(&b));
    }

    #[test]
    fn finish_requires_close_and_terminal_tasks() {
        let lifecycle = Lifecycle::new();
        lifecycle.start(Direction::Read).expect("启动读任务");
        assert!(lifecycle.try_finish().is_none(), "尚未请求关闭");

        assert!(lifecycle.request_close());
        assert!(!lifecycle.request_close(), "重复请求关闭返回 false");
        assert!(lifecycle.try_finish().is_none(), "读任务仍在运行");

        let failure = transport("reset");
        lifecycle.complete(Direction::Read, Some(failure.clone()));
        let completion = lifecycle.try_finish().expect("条件满足后最终化");
        assert!(completion.reader.expect("读失败").same_instance(&failure));
        assert!(completion.writer.is_none());
        assert!(lifecycle.is_closed());
        assert!(lifecycle.try_finish().is_none(), "最终化只发生一次");
    }

    #[test]
    fn start_after_close_request_is_rejected() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.start(Direction::Write), Ok(()));
        assert_eq!(lifecycle.start(Direction::Write), Err(StartError::AlreadyStarted));

        lifecycle.request_close();
        assert_eq!(lifecycle.start(Direction::Read), Err(StartError::Closing));
        lifecycle.complete(Direction::Write, None);
        assert!(lifecycle.try_finish().is_some());
    }
}

#![cfg(any(loom, sluice_loom))]

use loom::{model, sync::Arc, thread};
use sluice_io::ChannelError;
use sluice_net::{Direction, Lifecycle, StartError};
use std::io;

#[test]
fn concurrent_close_and_completion_finish_exactly_once() {
    //
    // 教案级说明：验证关闭请求与两个方向的完成在任意交错下恰好最终化一次。
    // - **Why**：描述符被关闭两次会误伤复用同一编号的新描述符，漏掉最终化则套接字永远不完成；
    // - **How**：读、写任务与关闭方各自在结束后调用 `try_finish`，Loom 穷举调度；
    // - **What**：三个线程中恰好一个拿到 `Completion`，且其中带着读方向记录的失败。
    model(|| {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.start(Direction::Read).expect("读任务启动");
        lifecycle.start(Direction::Write).expect("写任务启动");

        let reader = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || {
                let failure = ChannelError::transport("socket recv", io::ErrorKind::ConnectionReset.into());
                lifecycle.complete(Direction::Read, Some(failure));
                lifecycle.try_finish()
            })
        };
        let writer = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || {
                lifecycle.complete(Direction::Write, None);
                lifecycle.try_finish()
            })
        };

        let requested = lifecycle.request_close();
        let closer = lifecycle.try_finish();

        let results = [
            reader.join().expect("读线程不应 panic"),
            writer.join().expect("写线程不应 panic"),
            closer,
        ];
        assert!(requested);
        let finished: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(finished.len(), 1, "最终化必须恰好发生一次");
        assert!(finished[0].reader.is_some());
        assert!(finished[0].writer.is_none());
        assert!(lifecycle.is_closed());
    });
}

#[test]
fn start_racing_close_never_strands_the_socket() {
    //
    // 教案级说明：挂载与关闭并发时，要么任务正常启动并在结束后最终化，
    // 要么挂载被拒绝且由挂载方补做最终化，不存在两边都认为对方会收尾的交错。
    model(|| {
        let lifecycle = Arc::new(Lifecycle::new());

        let starter = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || match lifecycle.start(Direction::Read) {
                Ok(()) => {
                    lifecycle.complete(Direction::Read, None);
                    lifecycle.try_finish().is_some()
                }
                Err(StartError::Closing) => lifecycle.try_finish().is_some(),
                Err(StartError::AlreadyStarted) => unreachable!("只有一个线程启动读任务"),
            })
        };

        lifecycle.request_close();
        let closed_here = lifecycle.try_finish().is_some();
        let closed_there = starter.join().expect("启动线程不应 panic");

        assert!(closed_here ^ closed_there, "恰好一方完成最终化");
        assert!(lifecycle.is_closed());
    });
}

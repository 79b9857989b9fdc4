//! Thread affinity enforcement across adapters.

#[macro_use]
mod common;

use coadapt::{
    promise, Affinity, AwaitableEvent, CancelKind, Coroutine, Error, ErrorKind, EventMode,
    Outcome, ThreadQueue, WorkerPool,
};
use common::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

#[test]
fn pinned_start_off_thread_is_posted() {
    init_test("pinned_start_off_thread_is_posted");
    let (_queue, home) = spawn_queue("pinned-start");
    let co = Coroutine::spawn_pinned(&home, {
        let home = home.clone();
        async move { home.is_current() }
    });
    assert!(co.wait_timeout(CROSS_THREAD_TIMEOUT));
    assert!(co.join().expect("ran on home thread"));
    assert_eq!(co.affinity(), &Affinity::Pinned(home));
    test_complete!("pinned_start_off_thread_is_posted");
}

#[test]
fn every_resumption_of_a_pinned_coroutine_runs_on_its_thread() {
    init_test("every_resumption_of_a_pinned_coroutine_runs_on_its_thread");
    let (_queue, home) = spawn_queue("pinned-resume");
    let event = AwaitableEvent::new(EventMode::AutoReset, false);
    let (report, observed) = mpsc::channel();
    let co = Coroutine::builder().name("pinned-loop").pinned_to(&home).spawn({
        let home = home.clone();
        let event = event.clone();
        async move {
            for _ in 0..5 {
                (&event).await?;
                report.send(home.is_current()).expect("report");
            }
            Ok::<_, Error>(())
        }
    });

    for _ in 0..5 {
        let event = event.clone();
        thread::spawn(move || {
            while event.waiter_count() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            event.trigger();
        })
        .join()
        .expect("trigger thread");
        let on_home = observed.recv_timeout(CROSS_THREAD_TIMEOUT).expect("resumed");
        assert_with_log!(on_home, "resumed on pinned thread", true, on_home);
    }
    assert!(co.wait_timeout(CROSS_THREAD_TIMEOUT));
    assert!(co.join().expect("done").is_ok());
    assert_eq!(co.name(), Some("pinned-loop"));
    test_complete!("every_resumption_of_a_pinned_coroutine_runs_on_its_thread");
}

#[test]
fn shutting_down_the_home_thread_cancels_its_coroutine() {
    init_test("shutting_down_the_home_thread_cancels_its_coroutine");
    let queue = ThreadQueue::for_current_thread("soon-closed");
    let home = queue.descriptor();
    let (tx, rx) = promise::<u32>();
    let co = Coroutine::spawn_pinned(&home, async move { rx.await });
    assert!(!co.is_done());
    assert_eq!(queue.pinned_coroutines(), 1);

    queue.shutdown();
    assert!(co.is_done(), "unwound inline on the owning thread");
    let reason = match co.take_outcome() {
        Some(Outcome::Cancelled(reason)) => reason,
        other => panic!("expected shutdown cancellation, got {other:?}"),
    };
    assert_with_log!(
        reason.kind == CancelKind::Shutdown,
        "cancel kind",
        CancelKind::Shutdown,
        reason.kind
    );

    let setter = thread::spawn(move || tx.set(1));
    assert!(!setter.join().expect("setter"), "receiver went with the body");
    let err = queue.post(|| {}).expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::ThreadUnavailable);
    test_complete!("shutting_down_the_home_thread_cancels_its_coroutine");
}

#[test]
fn pinned_coroutine_resumes_home_after_awaited_coroutine_finishes_elsewhere() {
    init_test("pinned_coroutine_resumes_home_after_awaited_coroutine_finishes_elsewhere");
    let (_queue, home) = spawn_queue("awaiting-home");
    let pool = WorkerPool::new(1).expect("pool");
    let (tx, rx) = promise::<u32>();
    let (finished_on, finisher) = mpsc::channel();
    let inner = Coroutine::spawn(async move {
        let value = rx.await;
        finished_on
            .send(thread::current().name().map(String::from))
            .expect("report");
        value
    });
    assert!(!inner.is_done());

    let outer = Coroutine::spawn_pinned(&home, {
        let home = home.clone();
        let inner = inner.clone();
        async move {
            let before = home.is_current();
            let value = inner.await??;
            Ok::<_, Error>((value, before, home.is_current()))
        }
    });

    pool.post(move || {
        tx.set(42);
    })
    .expect("post to pool");
    let inner_thread = finisher.recv_timeout(CROSS_THREAD_TIMEOUT).expect("inner finished");
    assert_ne!(inner_thread.as_deref(), Some("awaiting-home"));

    assert!(outer.wait_timeout(CROSS_THREAD_TIMEOUT));
    let (value, before, after) = outer.join().expect("done").expect("value");
    assert_eq!(value, 42);
    assert!(before, "started on home thread");
    assert_with_log!(after, "resumed on home thread", true, after);
    test_complete!("pinned_coroutine_resumes_home_after_awaited_coroutine_finishes_elsewhere");
}

#[test]
fn main_loop_queue_drives_pinned_coroutine() {
    init_test("main_loop_queue_drives_pinned_coroutine");
    let queue = ThreadQueue::for_current_thread("main-loop");
    let home = queue.descriptor();
    let (tx, rx) = promise::<&'static str>();
    let co = Coroutine::spawn_pinned(&home, {
        let home = home.clone();
        async move {
            let value = rx.await?;
            Ok::<_, Error>((value, home.is_current()))
        }
    });
    thread::spawn(move || tx.set("from worker"))
        .join()
        .expect("setter");
    assert!(!co.is_done());

    let finished = queue
        .run_until(|| co.is_done(), CROSS_THREAD_TIMEOUT)
        .expect("pumping on owner thread");
    assert!(finished);
    let (value, on_home) = co.join().expect("done").expect("value");
    assert_eq!(value, "from worker");
    assert!(on_home);
    test_complete!("main_loop_queue_drives_pinned_coroutine");
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tasque_testing::{DeterministicExecutor, TestCallback};

use tasque_core::{cancelable_fn, ExecModel, Options, Task};

#[test]
fn cancel_runs_registered_cleanup_and_suppresses_the_callback() {
    let executor = DeterministicExecutor::new();
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);
    let task = Task::<i32>::create(move |ctx, callback| {
        let flag = Arc::clone(&flag);
        ctx.connection().push(cancelable_fn(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        drop(callback);
    });
    let probe = TestCallback::<i32>::new();
    let handle = task.run_async(&executor.handle(), Options::default(), probe.sink());
    executor.run_all();
    probe.assert_not_completed();

    handle.cancel();
    assert!(cleaned.load(Ordering::SeqCst));
    handle.cancel();
    executor.run_all();
    probe.assert_not_completed();
}

#[test]
fn do_on_cancel_fires_exactly_once() {
    let executor = DeterministicExecutor::new();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let task = Task::<i32>::never().do_on_cancel(Task::eval(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let probe = TestCallback::<i32>::new();
    let handle = task.run_async(&executor.handle(), Options::default(), probe.sink());
    executor.run_all();

    handle.cancel();
    handle.cancel();
    executor.run_all();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    probe.assert_not_completed();
}

#[test]
fn do_on_cancel_does_not_fire_after_success() {
    let executor = DeterministicExecutor::new();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let task = Task::pure(4).do_on_cancel(Task::eval(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let probe = TestCallback::new();
    let handle = task.run_async(&executor.handle(), Options::default(), probe.sink());
    assert_eq!(probe.value(), Some(4));

    handle.cancel();
    executor.run_all();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
}

#[test]
fn do_on_cancel_does_not_fire_after_failure() {
    let executor = DeterministicExecutor::new();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let task = Task::<i32>::fail("done for").do_on_cancel(Task::eval(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let probe = TestCallback::<i32>::new();
    let handle = task.run_async(&executor.handle(), Options::default(), probe.sink());
    assert_eq!(probe.error().expect("expected failure").to_string(), "done for");

    handle.cancel();
    executor.run_all();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
}

fn counting_chain(counter: Arc<AtomicUsize>, steps: usize) -> Task<usize> {
    (0..steps).fold(Task::pure(0), |acc, _| {
        let counter = Arc::clone(&counter);
        acc.flat_map(move |n| {
            let counter = Arc::clone(&counter);
            Task::eval(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                n + 1
            })
        })
    })
}

#[test]
fn auto_cancelable_binds_stop_mid_chain() {
    let executor = DeterministicExecutor::with_model(ExecModel::batched(2));
    let steps = Arc::new(AtomicUsize::new(0));
    let task = counting_chain(Arc::clone(&steps), 100);
    let probe = TestCallback::new();
    let handle = task.run_async(
        &executor.handle(),
        Options::default().auto_cancelable(),
        probe.sink(),
    );
    assert!(executor.pending() > 0, "expected the run to yield");
    handle.cancel();
    executor.run_all();
    probe.assert_not_completed();
    assert!(steps.load(Ordering::SeqCst) < 100);
}

#[test]
fn without_auto_cancelable_the_chain_finishes_silently() {
    let executor = DeterministicExecutor::with_model(ExecModel::batched(2));
    let steps = Arc::new(AtomicUsize::new(0));
    let task = counting_chain(Arc::clone(&steps), 100);
    let probe = TestCallback::new();
    let handle = task.run_async(&executor.handle(), Options::default(), probe.sink());
    handle.cancel();
    executor.run_all();
    // Cancellation is only honoured at suspension points: the synchronous
    // chain runs to its end but the completion never reaches the callback.
    assert_eq!(steps.load(Ordering::SeqCst), 100);
    probe.assert_not_completed();
}

#[test]
fn completion_after_the_callback_is_reported_not_delivered() {
    let executor = DeterministicExecutor::new();
    let task = Task::<i32>::create(|_, callback| {
        callback.succeed(1);
        panic!("registration kept going");
    });
    let probe = TestCallback::new();
    task.run_async(&executor.handle(), Options::default(), probe.sink());
    executor.run_all();
    assert_eq!(probe.value(), Some(1));
    assert_eq!(probe.completions(), 1);
    let failures = executor.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_panic());
}

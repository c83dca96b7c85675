use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as PollContext, Poll, Waker};

use tasque_testing::{run_to_result, DeterministicExecutor, TestCallback};

use tasque_core::{AsyncCallback, ExecModel, Fault, Options, Task};

#[test]
fn run_sync_maybe_returns_synchronous_values() {
    let executor = DeterministicExecutor::new();
    let task = Task::pure(2).map(|n| n + 1).flat_map(|n| Task::eval(move || n * 2));
    match task.run_sync_maybe(&executor.handle()) {
        Ok(value) => assert_eq!(value, 6),
        Err(_) => panic!("expected a synchronous completion"),
    }
    assert_eq!(executor.pending(), 0);
}

#[test]
fn run_sync_maybe_returns_synchronous_failures_as_settled_futures() {
    let executor = DeterministicExecutor::new();
    let task = Task::<i32>::fail("early");
    match task.run_sync_maybe(&executor.handle()) {
        Ok(_) => panic!("expected a failure"),
        Err(future) => {
            let result = future.try_result().expect("future should be settled");
            assert_eq!(result.unwrap_err().to_string(), "early");
        }
    }
}

#[test]
fn run_sync_maybe_spills_at_suspension_points() {
    let executor = DeterministicExecutor::new();
    let stashed: Arc<Mutex<Option<AsyncCallback<i32>>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&stashed);
    let task = Task::create(move |_, callback| {
        *stash.lock().unwrap() = Some(callback);
    })
    .map(|n: i32| n + 1);

    let future = match task.run_sync_maybe(&executor.handle()) {
        Ok(_) => panic!("expected a suspension"),
        Err(future) => future,
    };
    assert!(future.try_result().is_none());

    stashed
        .lock()
        .unwrap()
        .take()
        .expect("registration not reached")
        .succeed(5);
    executor.run_all();
    assert_eq!(future.try_result().expect("still pending").unwrap(), 6);
}

#[test]
fn run_future_settles_after_the_executor_drains() {
    let executor = DeterministicExecutor::with_model(ExecModel::AlwaysAsync);
    let future = Task::pure(3).run_future(&executor.handle(), Options::default());
    assert!(future.try_result().is_none());
    executor.run_all();
    assert_eq!(future.try_result().expect("settled").unwrap(), 3);
}

#[test]
fn always_async_defers_pure_values() {
    let executor = DeterministicExecutor::with_model(ExecModel::AlwaysAsync);
    let probe = TestCallback::new();
    Task::pure(1).run_async(&executor.handle(), Options::default(), probe.sink());
    probe.assert_not_completed();
    assert!(executor.pending() > 0);
    executor.run_all();
    assert_eq!(probe.value(), Some(1));
}

#[test]
fn batched_runs_bounded_bursts_between_yields() {
    const STEPS: usize = 100;
    const BATCH: usize = 8;
    let executor = DeterministicExecutor::with_model(ExecModel::batched(BATCH));
    let counter = Arc::new(AtomicUsize::new(0));
    let chain = (0..STEPS).fold(Task::pure(()), |acc, _| {
        let counter = Arc::clone(&counter);
        acc.flat_map(move |_| {
            let counter = Arc::clone(&counter);
            Task::eval(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    });
    let probe = TestCallback::new();
    chain.run_async(&executor.handle(), Options::default(), probe.sink());

    let mut progressed = counter.load(Ordering::SeqCst);
    assert!(progressed <= BATCH, "first burst ran {progressed} steps");
    let mut yields = 0;
    loop {
        let before = counter.load(Ordering::SeqCst);
        if !executor.tick() {
            break;
        }
        yields += 1;
        let after = counter.load(Ordering::SeqCst);
        assert!(after - before <= BATCH, "burst of {} steps", after - before);
        progressed = after;
    }
    assert_eq!(progressed, STEPS);
    assert!(yields >= STEPS / BATCH);
    assert_eq!(probe.completions(), 1);
}

#[test]
fn synchronous_model_never_yields() {
    let executor = DeterministicExecutor::with_model(ExecModel::Synchronous);
    let chain = (0..100u32).fold(Task::pure(0u32), |acc, _| acc.map(|n| n + 1).flat_map(Task::pure));
    let probe = TestCallback::new();
    chain.run_async(&executor.handle(), Options::default(), probe.sink());
    assert_eq!(probe.value(), Some(100));
    assert_eq!(executor.pending(), 0);
}

#[test]
fn execute_on_moves_the_run_to_the_target_executor() {
    let first = DeterministicExecutor::new();
    let second = DeterministicExecutor::new();
    let probe = TestCallback::new();
    Task::eval(|| 8)
        .execute_on(second.handle(), true)
        .run_async(&first.handle(), Options::default(), probe.sink());

    probe.assert_not_completed();
    assert_eq!(first.run_all(), 0);
    probe.assert_not_completed();
    assert!(second.run_all() > 0);
    assert_eq!(probe.value(), Some(8));
}

#[test]
fn defer_future_lifts_ready_futures() {
    let executor = DeterministicExecutor::new();
    let task = Task::defer_future(|| async { Ok(7) });
    let result = run_to_result(task, &executor, Options::default());
    assert_eq!(result.unwrap().unwrap(), 7);
}

/// Future completed by hand, for exercising wake-driven re-polls.
struct ManualFuture {
    state: Arc<Mutex<(Option<Result<i32, Fault>>, Option<Waker>)>>,
}

impl ManualFuture {
    fn new() -> (Self, Arc<Mutex<(Option<Result<i32, Fault>>, Option<Waker>)>>) {
        let state = Arc::new(Mutex::new((None, None)));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn fulfil(state: &Mutex<(Option<Result<i32, Fault>>, Option<Waker>)>, value: i32) {
        let waker = {
            let mut state = state.lock().unwrap();
            state.0 = Some(Ok(value));
            state.1.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Future for ManualFuture {
    type Output = Result<i32, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().unwrap();
        match state.0.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[test]
fn from_future_completes_on_wake() {
    let executor = DeterministicExecutor::new();
    let (future, state) = ManualFuture::new();
    let probe = TestCallback::new();
    Task::from_future(future).run_async(&executor.handle(), Options::default(), probe.sink());
    executor.run_all();
    probe.assert_not_completed();

    ManualFuture::fulfil(&state, 9);
    executor.run_all();
    assert_eq!(probe.value(), Some(9));
}

#[test]
fn from_future_is_single_shot() {
    let executor = DeterministicExecutor::new();
    let task = Task::from_future(async { Ok(1) });
    let first = run_to_result(task.clone(), &executor, Options::default());
    assert_eq!(first.unwrap().unwrap(), 1);

    let second = run_to_result(task, &executor, Options::default());
    let error = second.unwrap().unwrap_err();
    assert!(error.to_string().contains("already consumed"));
}

#[test]
fn from_future_cancellation_drops_the_future() {
    let executor = DeterministicExecutor::new();
    let (future, state) = ManualFuture::new();
    let probe = TestCallback::<i32>::new();
    let handle =
        Task::from_future(future).run_async(&executor.handle(), Options::default(), probe.sink());
    executor.run_all();

    handle.cancel();
    ManualFuture::fulfil(&state, 3);
    executor.run_all();
    probe.assert_not_completed();
}

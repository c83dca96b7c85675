use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tasque_testing::{run_to_result, DeterministicExecutor, TestCallback};

use tasque_core::{Fault, Options, Task};

fn counting_producer(counter: Arc<AtomicUsize>) -> Task<usize> {
    Task::eval(move || counter.fetch_add(1, Ordering::SeqCst) + 1)
}

#[test]
fn memoize_runs_the_producer_once() {
    let executor = DeterministicExecutor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let memo = counting_producer(Arc::clone(&calls)).memoize();

    let first = run_to_result(memo.clone(), &executor, Options::default());
    let second = run_to_result(memo, &executor, Options::default());
    assert_eq!(first.unwrap().unwrap(), 1);
    assert_eq!(second.unwrap().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn memoize_shares_across_clones() {
    let executor = DeterministicExecutor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let memo = counting_producer(Arc::clone(&calls)).memoize();
    let clones: Vec<_> = (0..10).map(|_| memo.clone()).collect();

    for clone in clones {
        let result = run_to_result(clone, &executor, Options::default());
        assert_eq!(result.unwrap().unwrap(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn memoized_result_is_served_synchronously_once_latched() {
    let executor = DeterministicExecutor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let memo = counting_producer(Arc::clone(&calls)).memoize();
    run_to_result(memo.clone(), &executor, Options::default());

    // The latched value completes during run_async, before the executor is
    // driven again.
    let probe = TestCallback::new();
    memo.run_async(&executor.handle(), Options::default(), probe.sink());
    assert_eq!(probe.value(), Some(1));
}

#[test]
fn memoize_on_success_retries_failures() {
    let executor = DeterministicExecutor::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Task::eval_result(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            Err(Fault::message("first try"))
        } else {
            Ok(n)
        }
    })
    .memoize_on_success();

    let first = run_to_result(flaky.clone(), &executor, Options::default());
    assert_eq!(first.unwrap().unwrap_err().to_string(), "first try");

    let second = run_to_result(flaky.clone(), &executor, Options::default());
    assert_eq!(second.unwrap().unwrap(), 2);

    let third = run_to_result(flaky, &executor, Options::default());
    assert_eq!(third.unwrap().unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn memoize_caches_failures_too() {
    let executor = DeterministicExecutor::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Task::<usize>::eval_result(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Fault::message("broken"))
    })
    .memoize();

    for _ in 0..3 {
        let result = run_to_result(flaky.clone(), &executor, Options::default());
        assert_eq!(result.unwrap().unwrap_err().to_string(), "broken");
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn memoizing_already_settled_tasks_is_identity() {
    let executor = DeterministicExecutor::new();
    let pure = Task::pure(9).memoize();
    assert_eq!(
        run_to_result(pure, &executor, Options::default())
            .unwrap()
            .unwrap(),
        9
    );

    let failed = Task::<i32>::fail("fixed").memoize_on_success();
    let result = run_to_result(failed, &executor, Options::default());
    assert_eq!(result.unwrap().unwrap_err().to_string(), "fixed");
}

#[test]
fn re_memoizing_with_the_same_policy_reuses_the_cell() {
    let executor = DeterministicExecutor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let memo = counting_producer(Arc::clone(&calls)).memoize();
    let twice = memo.clone().memoize();

    run_to_result(memo, &executor, Options::default());
    let result = run_to_result(twice, &executor, Options::default());
    assert_eq!(result.unwrap().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

//! Standard library backed runtime services for tasque.
//!
//! This crate provides concrete implementations of the executor abstraction
//! defined in `tasque-core`: an inline synchronous executor, a worker-pool
//! executor, a shared timer thread with [`sleep`] and [`TimeoutExt`], and
//! blocking bridges ([`block_on`], [`run_blocking`]) for synchronous
//! call sites and tests.

use std::future::Future;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use futures_task::ArcWake;
use tasque_core::{ExecModel, Executor, ExecutorRef, Fault, Job, Options, Task, Value};

mod pool;
mod timer;
mod trampoline;

pub use pool::PoolExecutor;
pub use timer::sleep;

/// Executor that runs everything inline on the submitting thread.
///
/// Submissions go through the thread-local trampoline, so self-resubmitting
/// runs flatten into a loop instead of recursing. Advertises the synchronous
/// execution model: no batching yields are inserted.
#[derive(Debug, Default)]
pub struct SyncExecutor;

impl SyncExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn into_ref(self) -> ExecutorRef {
        Arc::new(self)
    }
}

impl Executor for SyncExecutor {
    fn execute_async(&self, job: Job) {
        trampoline::execute(job);
    }

    fn execute_trampolined(&self, job: Job) {
        trampoline::execute(job);
    }

    fn report_failure(&self, error: Fault) {
        log::error!("unhandled task failure: {error}");
    }

    fn execution_model(&self) -> ExecModel {
        ExecModel::Synchronous
    }
}

/// Fails a task that does not produce its value within `duration`.
pub trait TimeoutExt<A: Value> {
    fn timeout(self, duration: Duration) -> Task<A>;
}

impl<A: Value> TimeoutExt<A> for Task<A> {
    fn timeout(self, duration: Duration) -> Task<A> {
        let fallback = sleep(duration)
            .flat_map(move |_| Task::fail(Fault::message(format!("timed out after {duration:?}"))));
        self.race(fallback)
    }
}

struct ThreadWaker {
    thread: Thread,
}

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.thread.unpark();
    }
}

/// Parks the current thread until `future` resolves.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    let waker = futures_task::waker(Arc::new(ThreadWaker {
        thread: thread::current(),
    }));
    let mut ctx = std::task::Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut ctx) {
            std::task::Poll::Ready(value) => return value,
            std::task::Poll::Pending => thread::park(),
        }
    }
}

/// Runs a task to completion, blocking the calling thread.
pub fn run_blocking<A: Value>(
    task: Task<A>,
    executor: &ExecutorRef,
    options: Options,
) -> Result<A, Fault> {
    block_on(task.run_future(executor, options))
}

#[cfg(test)]
#[path = "tests/std_runtime_tests.rs"]
mod tests;

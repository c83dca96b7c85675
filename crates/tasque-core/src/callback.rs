use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::ExecutorRef;
use crate::fault::Fault;
use crate::raw::{unerase, Val};
use crate::Value;

/// Completion sink for one run of a task.
///
/// The contract: exactly one of the two methods is ever invoked, exactly
/// once. Both consume the callback so the type system enforces the single
/// use; the run-loop additionally guards against double signals arriving
/// through shared internal paths and routes them to
/// [`report_failure`](crate::Executor::report_failure).
pub trait Callback<A>: Send {
    fn on_success(self: Box<Self>, value: A);
    fn on_error(self: Box<Self>, error: Fault);
}

/// Any `FnOnce(Result<A, Fault>)` is a callback.
impl<A, F> Callback<A> for F
where
    F: FnOnce(Result<A, Fault>) + Send,
{
    fn on_success(self: Box<Self>, value: A) {
        (*self)(Ok(value))
    }

    fn on_error(self: Box<Self>, error: Fault) {
        (*self)(Err(error))
    }
}

type ErasedSink = Box<dyn FnOnce(Result<Val, Fault>) + Send>;

/// At-most-once wrapper around the erased completion sink.
///
/// Cheap to clone; the first [`complete`](SafeCallback::complete) wins and
/// later signals are reported to the executor instead of the (spent) sink.
#[derive(Clone)]
pub(crate) struct SafeCallback {
    slot: Arc<Mutex<Option<ErasedSink>>>,
    executor: ExecutorRef,
}

impl SafeCallback {
    pub(crate) fn new(
        executor: ExecutorRef,
        sink: impl FnOnce(Result<Val, Fault>) + Send + 'static,
    ) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(sink)))),
            executor,
        }
    }

    /// Adapts a typed user callback into the erased sink.
    pub(crate) fn from_callback<A: Value, C: Callback<A> + 'static>(
        executor: ExecutorRef,
        callback: C,
    ) -> Self {
        let boxed: Box<dyn Callback<A>> = Box::new(callback);
        Self::new(executor, move |result| match result {
            Ok(value) => boxed.on_success(unerase::<A>(value)),
            Err(error) => boxed.on_error(error),
        })
    }

    /// Delivers the final result; extra signals go to the failure reporter.
    pub(crate) fn complete(&self, result: Result<Val, Fault>) {
        let sink = self.slot.lock().take();
        match sink {
            Some(sink) => sink(result),
            None => match result {
                Ok(_) => self.executor.report_failure(Fault::message(
                    "success signalled after the callback already completed",
                )),
                Err(error) => self.executor.report_failure(error),
            },
        }
    }
}

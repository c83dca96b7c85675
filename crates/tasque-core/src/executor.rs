use std::sync::Arc;

use crate::fault::Fault;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an executor implementation.
pub type ExecutorRef = Arc<dyn Executor>;

/// The pluggable execution surface the run-loop drives work through.
///
/// Implementations live outside this crate (see the companion std-backed
/// crate); the run-loop only relies on the contract below:
///
/// - [`execute_async`](Executor::execute_async) is a *real* hop: the job may
///   run on another thread, so the run-loop resets its batch counter across
///   it.
/// - [`execute_trampolined`](Executor::execute_trampolined) is a *light* hop:
///   when the implementation has a thread-local trampoline the job runs on
///   the current thread without growing the stack, and the batch counter
///   survives. The default forwards to `execute_async`.
/// - [`report_failure`](Executor::report_failure) receives errors that can no
///   longer be delivered to any callback (double completions, finalizer
///   errors, losers of a race that fail after the winner was chosen).
pub trait Executor: Send + Sync {
    /// Schedules `job` to run later, possibly on another thread.
    fn execute_async(&self, job: Job);

    /// Schedules `job` on a thread-local trampoline when one is available.
    fn execute_trampolined(&self, job: Job) {
        self.execute_async(job);
    }

    /// Sink of last resort for errors without a callback to land on.
    fn report_failure(&self, error: Fault);

    /// The batching behaviour runs on this executor default to.
    fn execution_model(&self) -> ExecModel {
        ExecModel::default()
    }
}

/// Controls how many synchronous bind reductions a run performs before it
/// yields back to the executor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecModel {
    /// Every bind crosses an asynchronous hop.
    AlwaysAsync,
    /// No model-driven yields; only real suspensions release the thread.
    Synchronous,
    /// Up to `n` binds run synchronously, then the run yields. `n` is a
    /// power of two, at least 2.
    Batched(usize),
}

impl ExecModel {
    /// Batch size used when nothing else is configured.
    pub const DEFAULT_BATCH: usize = 1024;

    /// A batched model with `n` rounded up to the nearest power of two ≥ 2.
    pub fn batched(n: usize) -> Self {
        ExecModel::Batched(n.next_power_of_two().max(2))
    }

    /// Next frame index after one bind reduction.
    ///
    /// A zero return value is the signal to insert an asynchronous hop.
    pub fn next_frame(self, index: usize) -> usize {
        match self {
            ExecModel::AlwaysAsync => 0,
            ExecModel::Synchronous => 1,
            ExecModel::Batched(n) => (index + 1) & (n - 1),
        }
    }

    /// Frame index a fresh run starts from.
    pub fn start_frame(self) -> usize {
        match self {
            ExecModel::AlwaysAsync => 0,
            ExecModel::Synchronous | ExecModel::Batched(_) => 1,
        }
    }
}

impl Default for ExecModel {
    fn default() -> Self {
        ExecModel::Batched(Self::DEFAULT_BATCH)
    }
}

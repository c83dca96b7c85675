//! Testing utilities for tasque.
//!
//! [`DeterministicExecutor`] queues every submission and only runs jobs when
//! the test drives it with [`tick`](DeterministicExecutor::tick) or
//! [`run_all`](DeterministicExecutor::run_all), which makes yield points,
//! suspensions and cancellation windows observable. [`TestCallback`] records
//! the completion of a run and how often the callback fired.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tasque_core::{ExecModel, Executor, ExecutorRef, Fault, Job, Options, Task, Value};

struct DetShared {
    queue: Mutex<VecDeque<Job>>,
    failures: Mutex<Vec<Fault>>,
    model: ExecModel,
}

/// Executor whose clock is the test: nothing runs until the test says so.
///
/// Reported failures are captured instead of logged, so tests can assert on
/// errors that end up at the sink of last resort.
#[derive(Clone)]
pub struct DeterministicExecutor {
    shared: Arc<DetShared>,
}

impl DeterministicExecutor {
    pub fn new() -> Self {
        Self::with_model(ExecModel::default())
    }

    pub fn with_model(model: ExecModel) -> Self {
        Self {
            shared: Arc::new(DetShared {
                queue: Mutex::new(VecDeque::new()),
                failures: Mutex::new(Vec::new()),
                model,
            }),
        }
    }

    /// A shareable executor reference driving this queue.
    pub fn handle(&self) -> ExecutorRef {
        Arc::new(self.clone())
    }

    /// Runs the oldest queued job. Returns false when the queue was empty.
    pub fn tick(&self) -> bool {
        let job = self
            .shared
            .queue
            .lock()
            .expect("deterministic queue poisoned")
            .pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Drains the queue, including jobs enqueued while draining. Returns the
    /// number of jobs executed.
    pub fn run_all(&self) -> usize {
        let mut executed = 0;
        while self.tick() {
            executed += 1;
            if executed > 10_000_000 {
                panic!("deterministic executor did not quiesce");
            }
        }
        executed
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("deterministic queue poisoned")
            .len()
    }

    /// Failures routed to the executor's reporter so far.
    pub fn failures(&self) -> Vec<Fault> {
        self.shared
            .failures
            .lock()
            .expect("failure log poisoned")
            .clone()
    }
}

impl Default for DeterministicExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for DeterministicExecutor {
    fn execute_async(&self, job: Job) {
        self.shared
            .queue
            .lock()
            .expect("deterministic queue poisoned")
            .push_back(job);
    }

    fn execute_trampolined(&self, job: Job) {
        // Kept in the same queue: light hops stay observable and ordered.
        self.execute_async(job);
    }

    fn report_failure(&self, error: Fault) {
        self.shared
            .failures
            .lock()
            .expect("failure log poisoned")
            .push(error);
    }

    fn execution_model(&self) -> ExecModel {
        self.shared.model
    }
}

struct Record<A> {
    completions: usize,
    last: Option<Result<A, Fault>>,
}

/// Records the outcome of a run and how many times the callback fired.
pub struct TestCallback<A> {
    record: Arc<Mutex<Record<A>>>,
}

impl<A> Clone for TestCallback<A> {
    fn clone(&self) -> Self {
        Self {
            record: Arc::clone(&self.record),
        }
    }
}

impl<A: Value> TestCallback<A> {
    pub fn new() -> Self {
        Self {
            record: Arc::new(Mutex::new(Record {
                completions: 0,
                last: None,
            })),
        }
    }

    /// The callback to hand to `run_async`.
    pub fn sink(&self) -> impl FnOnce(Result<A, Fault>) + Send + 'static {
        let record = Arc::clone(&self.record);
        move |result| {
            let mut record = record.lock().expect("test record poisoned");
            record.completions += 1;
            record.last = Some(result);
        }
    }

    pub fn completions(&self) -> usize {
        self.record.lock().expect("test record poisoned").completions
    }

    pub fn result(&self) -> Option<Result<A, Fault>> {
        self.record.lock().expect("test record poisoned").last.clone()
    }

    /// The success value, when the run succeeded.
    pub fn value(&self) -> Option<A> {
        self.result().and_then(|result| result.ok())
    }

    pub fn error(&self) -> Option<Fault> {
        self.result().and_then(|result| result.err())
    }

    pub fn assert_not_completed(&self) {
        assert_eq!(self.completions(), 0, "run completed unexpectedly");
    }
}

impl<A: Value> Default for TestCallback<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `task` on the deterministic executor and drains it to quiescence.
pub fn run_to_result<A: Value>(
    task: Task<A>,
    executor: &DeterministicExecutor,
    options: Options,
) -> Option<Result<A, Fault>> {
    let probe = TestCallback::new();
    task.run_async(&executor.handle(), options, probe.sink());
    executor.run_all();
    probe.result()
}

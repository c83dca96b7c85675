use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tasque_core::{ExecModel, Executor, ExecutorRef, Fault, Job};

use crate::trampoline;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size worker pool over a shared queue.
///
/// Dropping the last reference asks the workers to finish the queued jobs
/// and exit. Light hops run on the submitting thread's trampoline.
pub struct PoolExecutor {
    shared: Arc<PoolShared>,
    model: ExecModel,
}

impl PoolExecutor {
    pub fn new(threads: usize) -> Self {
        Self::with_model(threads, ExecModel::default())
    }

    pub fn with_model(threads: usize, model: ExecModel) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        for index in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("tasque-worker-{index}"))
                .spawn(move || worker(shared))
                .expect("failed to spawn pool worker");
        }
        Self { shared, model }
    }

    pub fn into_ref(self) -> ExecutorRef {
        Arc::new(self)
    }
}

fn worker(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("pool queue poisoned");
            }
        };
        match job {
            Some(job) => {
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("pool worker caught a panicking job");
                }
            }
            None => return,
        }
    }
}

impl Executor for PoolExecutor {
    fn execute_async(&self, job: Job) {
        self.shared
            .queue
            .lock()
            .expect("pool queue poisoned")
            .push_back(job);
        self.shared.available.notify_one();
    }

    fn execute_trampolined(&self, job: Job) {
        trampoline::execute(job);
    }

    fn report_failure(&self, error: Fault) {
        log::error!("unhandled task failure: {error}");
    }

    fn execution_model(&self) -> ExecModel {
        self.model
    }
}

impl Drop for PoolExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
    }
}

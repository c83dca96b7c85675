//! A single shared timer thread ordering deadlines in a binary heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tasque_core::{cancelable_fn, Task};

type TimerJob = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    job: TimerJob,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline sits on top of the max-heap.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct TimerShared {
    queue: Mutex<(BinaryHeap<TimerEntry>, u64)>,
    tick: Condvar,
}

fn timer() -> Arc<TimerShared> {
    static TIMER: OnceLock<Arc<TimerShared>> = OnceLock::new();
    Arc::clone(TIMER.get_or_init(|| {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new((BinaryHeap::new(), 0)),
            tick: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("tasque-timer".into())
            .spawn(move || timer_loop(worker))
            .expect("failed to spawn timer thread");
        shared
    }))
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut guard = shared.queue.lock().expect("timer queue poisoned");
    loop {
        let now = Instant::now();
        let next_deadline = guard.0.peek().map(|entry| entry.deadline);
        match next_deadline {
            Some(deadline) if deadline <= now => {
                let entry = guard.0.pop().expect("peeked entry vanished");
                drop(guard);
                (entry.job)();
                guard = shared.queue.lock().expect("timer queue poisoned");
            }
            Some(deadline) => {
                guard = shared
                    .tick
                    .wait_timeout(guard, deadline - now)
                    .expect("timer queue poisoned")
                    .0;
            }
            None => guard = shared.tick.wait(guard).expect("timer queue poisoned"),
        }
    }
}

fn schedule(deadline: Instant, job: TimerJob) {
    let shared = timer();
    let mut guard = shared.queue.lock().expect("timer queue poisoned");
    let sequence = guard.1;
    guard.1 += 1;
    guard.0.push(TimerEntry {
        deadline,
        sequence,
        job,
    });
    drop(guard);
    shared.tick.notify_one();
}

/// A task that completes with `()` after `duration`.
///
/// Cancelling the run detaches the pending completion; the timer entry
/// fires into an empty slot and nothing else happens.
pub fn sleep(duration: Duration) -> Task<()> {
    Task::create(move |ctx, callback| {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let connection = ctx.connection().clone();

        {
            let slot = Arc::clone(&slot);
            connection.push(cancelable_fn(move || {
                slot.lock().expect("sleep slot poisoned").take();
            }));
        }

        let fire_connection = connection.clone();
        schedule(
            Instant::now() + duration,
            Box::new(move || {
                let callback = slot.lock().expect("sleep slot poisoned").take();
                if let Some(callback) = callback {
                    // This suspension is still the top of its run's stack.
                    fire_connection.pop();
                    callback.succeed(());
                }
            }),
        );
    })
}

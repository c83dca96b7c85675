use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use tasque_core::Job;

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
    static QUEUE: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
}

struct ActiveReset;

impl Drop for ActiveReset {
    fn drop(&mut self) {
        QUEUE.with(|queue| queue.borrow_mut().clear());
        ACTIVE.with(|active| active.set(false));
    }
}

/// Runs `job` on the current thread without growing the stack.
///
/// When the thread is already inside a trampolined job, the new job is
/// queued and executed by the outermost frame, so mutually re-submitting
/// jobs flatten into a loop instead of recursing.
pub fn execute(job: Job) {
    if ACTIVE.with(|active| active.replace(true)) {
        QUEUE.with(|queue| queue.borrow_mut().push_back(job));
        return;
    }
    let _reset = ActiveReset;
    job();
    loop {
        let next = QUEUE.with(|queue| queue.borrow_mut().pop_front());
        match next {
            Some(job) => job(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn nested_submissions_run_in_submission_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        execute(Box::new(move || {
            let inner = Arc::clone(&log);
            log.lock().unwrap().push(1);
            execute(Box::new(move || inner.lock().unwrap().push(3)));
            log.lock().unwrap().push(2);
        }));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn deep_resubmission_does_not_overflow() {
        let count = Arc::new(AtomicUsize::new(0));

        fn bounce(count: Arc<AtomicUsize>) {
            if count.fetch_add(1, Ordering::Relaxed) < 100_000 {
                execute(Box::new(move || bounce(count)));
            }
        }

        let counter = Arc::clone(&count);
        execute(Box::new(move || bounce(counter)));
        assert_eq!(count.load(Ordering::Relaxed), 100_001);
    }
}

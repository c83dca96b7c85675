use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::executor::ExecutorRef;
use crate::options::Options;
use crate::raw::Raw;

/// Something that can be cancelled. Implementations must tolerate repeated
/// calls; only the first one is expected to have an effect.
pub trait Cancelable: Send + Sync {
    fn cancel(&self);
}

/// Shared reference to a cancel action.
pub type CancelRef = Arc<dyn Cancelable>;

/// Wraps a one-shot closure into a [`Cancelable`].
pub fn cancelable_fn(action: impl FnOnce() + Send + 'static) -> CancelRef {
    Arc::new(FnCancelable {
        action: Mutex::new(Some(Box::new(action))),
    })
}

struct FnCancelable {
    action: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl Cancelable for FnCancelable {
    fn cancel(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }
}

enum StackState {
    Active(Vec<CancelRef>),
    Cancelled,
}

/// Thread-safe LIFO of cancel actions for one run.
///
/// While a run is live, every active asynchronous operation keeps its cleanup
/// at the top of the stack and pops it when it completes normally.
/// [`cancel`](CancelStack::cancel) flips the stack into its terminal state
/// and invokes every entry, most recent first; pushing onto a cancelled stack
/// invokes the entry immediately instead of retaining it.
#[derive(Clone)]
pub struct CancelStack {
    inner: Arc<Mutex<StackState>>,
}

impl CancelStack {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StackState::Active(Vec::new()))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.lock(), StackState::Cancelled)
    }

    /// Pushes one cancel action, or runs it right away when already
    /// cancelled.
    pub fn push(&self, cancelable: CancelRef) {
        {
            let mut state = self.inner.lock();
            if let StackState::Active(entries) = &mut *state {
                entries.push(cancelable);
                return;
            }
        }
        cancelable.cancel();
    }

    /// Pushes a collection of cancel actions as a single composite entry.
    pub fn push_all(&self, items: impl IntoIterator<Item = CancelRef>) {
        let composite: CancelRef = Arc::new(Composite {
            items: items.into_iter().collect(),
        });
        self.push(composite);
    }

    /// Removes and returns the most recently pushed entry, if any.
    pub fn pop(&self) -> Option<CancelRef> {
        match &mut *self.inner.lock() {
            StackState::Active(entries) => entries.pop(),
            StackState::Cancelled => None,
        }
    }

    /// Marks the stack cancelled and runs all entries, most recent first.
    ///
    /// Idempotent: the second and later calls observe the terminal state and
    /// do nothing.
    pub fn cancel(&self) {
        let drained = {
            let mut state = self.inner.lock();
            match std::mem::replace(&mut *state, StackState::Cancelled) {
                StackState::Active(entries) => entries,
                StackState::Cancelled => Vec::new(),
            }
        };
        if !drained.is_empty() {
            log::trace!("cancelling run, unwinding {} cancel action(s)", drained.len());
        }
        for entry in drained.into_iter().rev() {
            entry.cancel();
        }
    }
}

impl Default for CancelStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancelable for CancelStack {
    fn cancel(&self) {
        CancelStack::cancel(self);
    }
}

struct Composite {
    items: Vec<CancelRef>,
}

impl Cancelable for Composite {
    fn cancel(&self) {
        for item in self.items.iter().rev() {
            item.cancel();
        }
    }
}

/// Handle returned by the run entry points; cancelling it cancels the run.
#[derive(Clone)]
pub struct CancelHandle {
    stack: CancelStack,
}

impl CancelHandle {
    pub(crate) fn new(stack: CancelStack) -> Self {
        Self { stack }
    }

    /// Cancels the run. Idempotent; after the first call no further success
    /// or error reaches the run's callback.
    pub fn cancel(&self) {
        self.stack.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stack.is_cancelled()
    }
}

impl Cancelable for CancelHandle {
    fn cancel(&self) {
        self.stack.cancel();
    }
}

/// Cancel action that evaluates a finalizer task through the executor.
///
/// Errors raised by the finalizer have no callback to land on and go to
/// [`report_failure`](crate::Executor::report_failure).
pub(crate) fn finalizer_action(
    finalizer: Raw,
    executor: ExecutorRef,
    options: Options,
) -> CancelRef {
    cancelable_fn(move || {
        let context = Context::new(executor.clone(), options);
        let sink = crate::callback::SafeCallback::new(executor.clone(), move |result| {
            if let Err(error) = result {
                executor.report_failure(error);
            }
        });
        let run_executor = context.executor().clone();
        run_executor.execute_async(Box::new(move || {
            crate::run_loop::start(finalizer, context, sink);
        }));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_runs_entries_lifo_and_at_most_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let stack = CancelStack::new();
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            stack.push(cancelable_fn(move || order.lock().push(label)));
        }
        stack.cancel();
        stack.cancel();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn push_after_cancel_fires_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let stack = CancelStack::new();
        stack.cancel();
        let counter = Arc::clone(&fired);
        stack.push(cancelable_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(stack.is_cancelled());
    }

    #[test]
    fn pop_removes_the_most_recent_entry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let stack = CancelStack::new();
        let counter = Arc::clone(&fired);
        stack.push(cancelable_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let popped = stack.pop();
        assert!(popped.is_some());
        stack.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn composite_entries_cancel_their_members() {
        let fired = Arc::new(AtomicUsize::new(0));
        let stack = CancelStack::new();
        let a = Arc::clone(&fired);
        let b = Arc::clone(&fired);
        stack.push_all([
            cancelable_fn(move || {
                a.fetch_add(1, Ordering::SeqCst);
            }),
            cancelable_fn(move || {
                b.fetch_add(1, Ordering::SeqCst);
            }),
        ]);
        stack.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}

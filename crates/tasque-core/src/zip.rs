//! Parallel pair: run two tasks concurrently and combine their results.
//! The first failure wins, cancels the sibling, and becomes the outcome.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{cancelable_fn, CancelRef, CancelStack};
use crate::fault::Fault;
use crate::raw::{protect, unerase, Val};
use crate::run_loop;
use crate::{AsyncCallback, Task, Value};

enum PairState<A, B> {
    Neither,
    GotLeft(A),
    GotRight(B),
    Failed,
    Cancelled,
    Finished,
}

pub(crate) fn zip_par_with<A, B, C, F>(left: Task<A>, right: Task<B>, combine: F) -> Task<C>
where
    A: Value,
    B: Value,
    C: Value,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    let combine = Arc::new(combine);
    Task::create(move |ctx, callback: AsyncCallback<C>| {
        let state = Arc::new(Mutex::new(PairState::<A, B>::Neither));
        let callback = Arc::new(Mutex::new(Some(callback)));
        let combine = Arc::clone(&combine);

        let left_stack = CancelStack::new();
        let right_stack = CancelStack::new();
        let parent = ctx.connection().clone();
        parent.push_all([
            {
                let state = Arc::clone(&state);
                cancelable_fn(move || {
                    *state.lock() = PairState::Cancelled;
                })
            },
            Arc::new(left_stack.clone()) as CancelRef,
            Arc::new(right_stack.clone()) as CancelRef,
        ]);

        let executor = ctx.executor().clone();

        run_loop::spawn(left.clone().raw, ctx.fork(left_stack.clone()), {
            let state = Arc::clone(&state);
            let callback = Arc::clone(&callback);
            let combine = Arc::clone(&combine);
            let parent = parent.clone();
            let sibling = right_stack.clone();
            let executor = executor.clone();
            move |result: Result<Val, Fault>| match result.map(unerase::<A>) {
                Ok(value) => {
                    let both = {
                        let mut state = state.lock();
                        match std::mem::replace(&mut *state, PairState::Finished) {
                            PairState::Neither => {
                                *state = PairState::GotLeft(value);
                                None
                            }
                            PairState::GotRight(other) => Some((value, other)),
                            previous => {
                                *state = previous;
                                None
                            }
                        }
                    };
                    if let Some((a, b)) = both {
                        finish(&parent, &callback, protect(|| combine(a, b)));
                    }
                }
                Err(fault) => on_failure(
                    fault, &state, &callback, &parent, &sibling, &executor,
                ),
            }
        });

        run_loop::spawn(right.clone().raw, ctx.fork(right_stack), {
            let state = Arc::clone(&state);
            let callback = Arc::clone(&callback);
            let combine = Arc::clone(&combine);
            let parent = parent.clone();
            let sibling = left_stack;
            move |result: Result<Val, Fault>| match result.map(unerase::<B>) {
                Ok(value) => {
                    let both = {
                        let mut state = state.lock();
                        match std::mem::replace(&mut *state, PairState::Finished) {
                            PairState::Neither => {
                                *state = PairState::GotRight(value);
                                None
                            }
                            PairState::GotLeft(other) => Some((other, value)),
                            previous => {
                                *state = previous;
                                None
                            }
                        }
                    };
                    if let Some((a, b)) = both {
                        finish(&parent, &callback, protect(|| combine(a, b)));
                    }
                }
                Err(fault) => on_failure(
                    fault, &state, &callback, &parent, &sibling, &executor,
                ),
            }
        });
    })
}

/// First failure claims the pair, cancels the sibling and surfaces the
/// fault; anything after a terminal state goes to the failure reporter.
fn on_failure<A, B, C: Value>(
    fault: Fault,
    state: &Mutex<PairState<A, B>>,
    callback: &Mutex<Option<AsyncCallback<C>>>,
    parent: &CancelStack,
    sibling: &CancelStack,
    executor: &crate::executor::ExecutorRef,
) {
    let first = {
        let mut state = state.lock();
        match &*state {
            PairState::Failed | PairState::Cancelled | PairState::Finished => false,
            _ => {
                *state = PairState::Failed;
                true
            }
        }
    };
    if first {
        sibling.cancel();
        parent.pop();
        let callback = callback.lock().take();
        if let Some(callback) = callback {
            callback.fail(fault);
        }
    } else {
        log::trace!("parallel pair dropped a late failure");
        executor.report_failure(fault);
    }
}

fn finish<C: Value>(
    parent: &CancelStack,
    callback: &Mutex<Option<AsyncCallback<C>>>,
    combined: Result<C, Fault>,
) {
    parent.pop();
    let callback = callback.lock().take();
    if let Some(callback) = callback {
        callback.complete(combined);
    }
}

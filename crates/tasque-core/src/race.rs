//! Race-of-two: both sides start concurrently, the first completion wins,
//! and the loser is handed back as a [`CancelableFuture`] the caller can
//! await or cancel.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{CancelHandle, CancelRef, CancelStack};
use crate::fault::Fault;
use crate::future::{CancelableFuture, Promise};
use crate::raw::{unerase, Val};
use crate::run_loop;
use crate::{AsyncCallback, FirstOf, Task, Value};

const UNDECIDED: u8 = 0;
const LEFT: u8 = 1;
const RIGHT: u8 = 2;

pub(crate) fn select_either<A: Value, B: Value>(
    left: Task<A>,
    right: Task<B>,
) -> Task<FirstOf<A, B>> {
    Task::create(move |ctx, callback: AsyncCallback<FirstOf<A, B>>| {
        let winner = Arc::new(AtomicU8::new(UNDECIDED));
        // Set once the winner finished with an error: the loser handle was
        // never exposed, so any late loser error has nowhere to go but the
        // executor's failure reporter.
        let abandoned = Arc::new(AtomicBool::new(false));
        let callback = Arc::new(Mutex::new(Some(callback)));

        let left_stack = CancelStack::new();
        let right_stack = CancelStack::new();
        let parent = ctx.connection().clone();
        parent.push_all([
            Arc::new(left_stack.clone()) as CancelRef,
            Arc::new(right_stack.clone()) as CancelRef,
        ]);

        let (left_future, left_promise) =
            CancelableFuture::<A>::pending(CancelHandle::new(left_stack.clone()));
        let (right_future, right_promise) =
            CancelableFuture::<B>::pending(CancelHandle::new(right_stack.clone()));

        let executor = ctx.executor().clone();
        run_loop::spawn(left.clone().raw, ctx.fork(left_stack.clone()), {
            let winner = Arc::clone(&winner);
            let abandoned = Arc::clone(&abandoned);
            let callback = Arc::clone(&callback);
            let parent = parent.clone();
            let sibling = right_stack.clone();
            let loser_future = right_future;
            let executor = executor.clone();
            move |result: Result<Val, Fault>| {
                let result = result.map(unerase::<A>);
                if winner
                    .compare_exchange(UNDECIDED, LEFT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    parent.pop();
                    let callback = callback.lock().take();
                    match result {
                        Ok(value) => {
                            if let Some(callback) = callback {
                                callback.succeed(FirstOf::Left(value, loser_future));
                            }
                        }
                        Err(fault) => {
                            abandoned.store(true, Ordering::Release);
                            sibling.cancel();
                            if let Some(callback) = callback {
                                callback.fail(fault);
                            }
                        }
                    }
                } else {
                    settle_loser(result, &left_promise, &abandoned, &executor);
                }
            }
        });

        let executor = ctx.executor().clone();
        run_loop::spawn(right.clone().raw, ctx.fork(right_stack), {
            let winner = Arc::clone(&winner);
            let abandoned = Arc::clone(&abandoned);
            let callback = Arc::clone(&callback);
            let parent = parent.clone();
            let sibling = left_stack.clone();
            let loser_future = left_future;
            move |result: Result<Val, Fault>| {
                let result = result.map(unerase::<B>);
                if winner
                    .compare_exchange(UNDECIDED, RIGHT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    parent.pop();
                    let callback = callback.lock().take();
                    match result {
                        Ok(value) => {
                            if let Some(callback) = callback {
                                callback.succeed(FirstOf::Right(loser_future, value));
                            }
                        }
                        Err(fault) => {
                            abandoned.store(true, Ordering::Release);
                            sibling.cancel();
                            if let Some(callback) = callback {
                                callback.fail(fault);
                            }
                        }
                    }
                } else {
                    settle_loser(result, &right_promise, &abandoned, &executor);
                }
            }
        });
    })
}

/// A loser's outcome flows into its handle; when the handle was never
/// exposed (the winner failed), errors go to the failure reporter instead.
fn settle_loser<T: Value>(
    result: Result<T, Fault>,
    promise: &Promise<T>,
    abandoned: &AtomicBool,
    executor: &crate::executor::ExecutorRef,
) {
    if abandoned.load(Ordering::Acquire) {
        if let Err(fault) = result {
            log::trace!("race loser failed after the winner's error");
            executor.report_failure(fault);
        }
        return;
    }
    if !promise.complete(result.clone()) {
        if let Err(fault) = result {
            executor.report_failure(fault);
        }
    }
}

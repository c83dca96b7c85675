//! Lifting `std::future::Future` values into tasks.
//!
//! The future is polled on the run's executor: each wake schedules one poll
//! through a light hop, and cancelling the run drops the future in place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as PollContext, Poll};

use futures_task::ArcWake;
use parking_lot::Mutex;

use crate::cancel::{cancelable_fn, CancelStack};
use crate::context::Context;
use crate::executor::ExecutorRef;
use crate::fault::Fault;
use crate::{AsyncCallback, Value};

pub(crate) type BoxedFuture<A> = Pin<Box<dyn Future<Output = Result<A, Fault>> + Send>>;

enum DriveState<A: Value> {
    /// Parked between polls; holds the future and the pending completion.
    Idle(BoxedFuture<A>, AsyncCallback<A>),
    /// Some thread is inside `poll`.
    Polling,
    /// A wake arrived mid-poll; the polling thread loops once more.
    Repoll,
    /// Completed or cancelled; the future is gone.
    Done,
}

struct Driver<A: Value> {
    executor: ExecutorRef,
    connection: CancelStack,
    state: Mutex<DriveState<A>>,
}

impl<A: Value> ArcWake for Driver<A> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let should_schedule = {
            let mut state = arc_self.state.lock();
            match &*state {
                DriveState::Polling => {
                    *state = DriveState::Repoll;
                    false
                }
                DriveState::Idle(..) => true,
                DriveState::Repoll | DriveState::Done => false,
            }
        };
        if should_schedule {
            let driver = Arc::clone(arc_self);
            let executor = driver.executor.clone();
            executor.execute_trampolined(Box::new(move || poll_driver(driver)));
        }
    }
}

/// Starts driving `future` inside the given run context.
pub(crate) fn drive<A: Value>(ctx: &Context, future: BoxedFuture<A>, callback: AsyncCallback<A>) {
    let driver = Arc::new(Driver {
        executor: ctx.executor().clone(),
        connection: ctx.connection().clone(),
        state: Mutex::new(DriveState::Idle(future, callback)),
    });
    let entry = {
        let driver = Arc::clone(&driver);
        cancelable_fn(move || {
            // Dropping the state releases the future and the callback.
            *driver.state.lock() = DriveState::Done;
        })
    };
    ctx.connection().push(entry);
    poll_driver(driver);
}

fn poll_driver<A: Value>(driver: Arc<Driver<A>>) {
    let (mut future, callback) = {
        let mut state = driver.state.lock();
        match std::mem::replace(&mut *state, DriveState::Polling) {
            DriveState::Idle(future, callback) => (future, callback),
            other => {
                *state = other;
                return;
            }
        }
    };
    let waker = futures_task::waker(Arc::clone(&driver));
    let mut poll_ctx = PollContext::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut poll_ctx) {
            Poll::Ready(result) => {
                *driver.state.lock() = DriveState::Done;
                driver.connection.pop();
                callback.complete(result);
                return;
            }
            Poll::Pending => {
                let mut state = driver.state.lock();
                match &*state {
                    DriveState::Repoll => {
                        *state = DriveState::Polling;
                    }
                    DriveState::Done => return,
                    _ => {
                        *state = DriveState::Idle(future, callback);
                        return;
                    }
                }
            }
        }
    }
}

//! `CancelableFuture`: the bridge between a running task and
//! `std::future::Future` consumers. The same type serves as the loser handle
//! of a race, so a not-yet-finished side can be awaited, converted back into
//! a task, or cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as PollContext, Poll, Waker};

use parking_lot::Mutex;

use crate::cancel::CancelHandle;
use crate::fault::Fault;
use crate::{Task, Value};

type Listener<A> = Box<dyn FnOnce(Result<A, Fault>) + Send>;

enum FutState<A> {
    Pending {
        wakers: Vec<Waker>,
        listeners: Vec<Listener<A>>,
    },
    Done(Result<A, Fault>),
}

/// Handle to a run in flight: a future over its outcome plus the power to
/// cancel it. Cloning shares the same underlying run.
pub struct CancelableFuture<A> {
    shared: Arc<Mutex<FutState<A>>>,
    handle: CancelHandle,
}

impl<A> Clone for CancelableFuture<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handle: self.handle.clone(),
        }
    }
}

impl<A: Value> CancelableFuture<A> {
    pub(crate) fn pending(handle: CancelHandle) -> (Self, Promise<A>) {
        let shared = Arc::new(Mutex::new(FutState::Pending {
            wakers: Vec::new(),
            listeners: Vec::new(),
        }));
        let future = Self {
            shared: Arc::clone(&shared),
            handle,
        };
        (future, Promise { shared })
    }

    pub(crate) fn completed(result: Result<A, Fault>, handle: CancelHandle) -> Self {
        Self {
            shared: Arc::new(Mutex::new(FutState::Done(result))),
            handle,
        }
    }

    /// Cancels the underlying run. Idempotent; a cancelled run never
    /// completes this future.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// The outcome, when the run has already finished.
    pub fn try_result(&self) -> Option<Result<A, Fault>> {
        match &*self.shared.lock() {
            FutState::Done(result) => Some(result.clone()),
            FutState::Pending { .. } => None,
        }
    }

    pub(crate) fn subscribe(&self, listener: impl FnOnce(Result<A, Fault>) + Send + 'static) {
        let mut slot = Some(Box::new(listener) as Listener<A>);
        let ready = {
            let mut state = self.shared.lock();
            match &mut *state {
                FutState::Done(result) => Some(result.clone()),
                FutState::Pending { listeners, .. } => {
                    listeners.push(slot.take().expect("listener consumed twice"));
                    None
                }
            }
        };
        if let (Some(result), Some(listener)) = (ready, slot) {
            listener(result);
        }
    }

    /// Re-enters the task world: a task that completes when this future
    /// does. Cancelling a run of the task cancels the underlying run.
    pub fn into_task(self) -> Task<A> {
        Task::create(move |ctx, callback| {
            let future = self.clone();
            let connection = ctx.connection().clone();
            connection.push(Arc::new(future.handle.clone()));
            future.subscribe(move |result| {
                connection.pop();
                callback.complete(result);
            });
        })
    }
}

impl<A: Value> Future for CancelableFuture<A> {
    type Output = Result<A, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        match &mut *state {
            FutState::Done(result) => Poll::Ready(result.clone()),
            FutState::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Completion side of a [`CancelableFuture`].
pub(crate) struct Promise<A> {
    shared: Arc<Mutex<FutState<A>>>,
}

impl<A: Value> Promise<A> {
    /// Settles the future. Returns false when it was already settled.
    pub(crate) fn complete(&self, result: Result<A, Fault>) -> bool {
        let (wakers, listeners) = {
            let mut state = self.shared.lock();
            match std::mem::replace(&mut *state, FutState::Done(result.clone())) {
                FutState::Pending { wakers, listeners } => (wakers, listeners),
                done @ FutState::Done(_) => {
                    *state = done;
                    return false;
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(result.clone());
        }
        true
    }
}

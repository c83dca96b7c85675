//! The broadcast cell behind `memoize`: runs its producing task at most
//! once and replays the outcome to every subscriber.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::SafeCallback;
use crate::cancel::{cancelable_fn, CancelStack};
use crate::context::Context;
use crate::fault::Fault;
use crate::raw::{Raw, Val};
use crate::run_loop::{self, Restart};

type Subscriber = Box<dyn FnOnce(Result<Val, Fault>) + Send>;

enum MemoState {
    Empty,
    Running {
        subscribers: Vec<(u64, Subscriber)>,
        next_id: u64,
    },
    Done(Result<Val, Fault>),
}

pub(crate) struct MemoCell {
    producer: Raw,
    cache_faults: bool,
    state: Mutex<MemoState>,
}

impl MemoCell {
    pub(crate) fn new(producer: Raw, cache_faults: bool) -> Self {
        Self {
            producer,
            cache_faults,
            state: Mutex::new(MemoState::Empty),
        }
    }

    pub(crate) fn cache_faults(&self) -> bool {
        self.cache_faults
    }

    /// Fast path: the latched result, when the cell is already terminal.
    pub(crate) fn peek(&self) -> Option<Result<Val, Fault>> {
        match &*self.state.lock() {
            MemoState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let MemoState::Running { subscribers, .. } = &mut *self.state.lock() {
            subscribers.retain(|(entry, _)| *entry != id);
        }
    }

    /// Terminal transition performed by the elected runner's completion.
    ///
    /// With `cache_faults` off a failure resets the cell so the next run
    /// retries the producer.
    fn finish(&self, result: Result<Val, Fault>) {
        let subscribers = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(
                &mut *state,
                if result.is_err() && !self.cache_faults {
                    MemoState::Empty
                } else {
                    MemoState::Done(result.clone())
                },
            );
            match previous {
                MemoState::Running { subscribers, .. } => subscribers,
                _ => Vec::new(),
            }
        };
        log::trace!("memo cell settled ({} subscriber(s))", subscribers.len());
        for (_, subscriber) in subscribers {
            subscriber(result.clone());
        }
    }
}

enum Action {
    Deliver(Result<Val, Fault>),
    Run(Raw),
    Subscribed,
}

fn subscriber_for(connection: CancelStack, restart: Restart) -> Subscriber {
    Box::new(move |result| {
        // The unsubscribe entry registered below is still the top of this
        // run's stack while it sits suspended on the cell.
        connection.pop();
        restart.signal(result);
    })
}

/// Hooks a suspended run onto the cell: delivers a latched result, elects
/// the caller as the single runner, or subscribes it to the run in flight.
///
/// A subscriber parks an unsubscribe action on its own cancellation stack,
/// so cancelling that run only detaches it; the shared run is owned by the
/// first caller's stack and keeps going.
pub(crate) fn dispatch(cell: Arc<MemoCell>, ctx: &Context, restart: Restart) {
    // Registered before subscribing so a delivery racing this call can only
    // find the entry it pops already in place. The sentinel matches no
    // subscription until the real id is assigned under the state lock.
    let id_slot = Arc::new(Mutex::new(u64::MAX));
    let action = {
        let cell = Arc::clone(&cell);
        let id_slot = Arc::clone(&id_slot);
        cancelable_fn(move || {
            let id = *id_slot.lock();
            cell.unsubscribe(id);
        })
    };
    ctx.connection.push(action);

    let outcome = {
        let mut state = cell.state.lock();
        match &mut *state {
            MemoState::Done(result) => Action::Deliver(result.clone()),
            MemoState::Empty => {
                *id_slot.lock() = 0;
                let first = subscriber_for(ctx.connection.clone(), restart.clone());
                *state = MemoState::Running {
                    subscribers: vec![(0, first)],
                    next_id: 1,
                };
                Action::Run(cell.producer.clone())
            }
            MemoState::Running {
                subscribers,
                next_id,
            } => {
                let id = *next_id;
                *next_id += 1;
                *id_slot.lock() = id;
                subscribers.push((id, subscriber_for(ctx.connection.clone(), restart.clone())));
                Action::Subscribed
            }
        }
    };

    match outcome {
        Action::Deliver(result) => {
            ctx.connection.pop();
            restart.signal(result);
        }
        Action::Run(producer) => {
            log::trace!("memo cell elected a runner");
            // The producer runs on the electing caller's stack: cancelling
            // that run during the running window cancels the shared run.
            let producer_ctx = ctx.fork(ctx.connection.clone());
            let executor = producer_ctx.executor.clone();
            let sink = SafeCallback::new(executor, move |result| cell.finish(result));
            run_loop::start(producer, producer_ctx, sink);
        }
        Action::Subscribed => {}
    }
}

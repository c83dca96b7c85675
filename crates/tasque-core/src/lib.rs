//! Lazy, cancellable task descriptions and the run-loop that evaluates them.
//!
//! A [`Task`] is an immutable description of a computation that, when run,
//! produces a value or a [`Fault`]. Nothing happens until one of the run
//! entry points is called with an [`Executor`]: the description tree is then
//! driven by a trampolined loop that stays stack-safe under arbitrarily deep
//! sequencing, yields cooperatively according to the executor's
//! [`ExecModel`], and honours cancellation with deterministic cleanup.
//!
//! ```
//! use tasque_core::{Options, Task};
//! use tasque_testing::DeterministicExecutor;
//!
//! let exec = DeterministicExecutor::new();
//! let task = Task::eval(|| 20).map(|n| n + 1).flat_map(|n| Task::pure(n + 1));
//! task.run_async(&exec.handle(), Options::default(), |result| {
//!     assert_eq!(result.unwrap(), 22);
//! });
//! exec.run_all();
//! ```
//!
//! Executor implementations live in the companion std-backed crate; this
//! crate only defines the [`Executor`] contract they fill in.

mod callback;
mod cancel;
mod context;
mod executor;
mod fault;
mod future;
mod interop;
mod memo;
mod options;
mod race;
mod raw;
mod run_loop;
mod zip;

pub use callback::Callback;
pub use cancel::{cancelable_fn, CancelHandle, CancelRef, CancelStack, Cancelable};
pub use context::Context;
pub use executor::{ExecModel, Executor, ExecutorRef, Job};
pub use fault::Fault;
pub use future::CancelableFuture;
pub use options::Options;

use std::marker::PhantomData;
use std::sync::Arc;

use callback::SafeCallback;
use memo::MemoCell;
use raw::{erase, unerase, Raw, MAP_FUSION_MAX};
use run_loop::SyncStep;

/// Marker for types that can travel through a task: cloneable, sendable and
/// owned. Blanket-implemented; never implement it by hand.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// An immutable, shareable description of a computation producing an `A`.
///
/// Descriptions are cheap to clone and every run re-evaluates their effects
/// from scratch, unless explicitly latched with [`Task::eval_once`] or
/// shared with [`Task::memoize`].
pub struct Task<A> {
    pub(crate) raw: Raw,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Task<A> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

/// Outcome of [`Task::select_either`]: the winner's value plus a live handle
/// to the still-running loser.
#[derive(Clone)]
pub enum FirstOf<A, B> {
    /// The left side finished first.
    Left(A, CancelableFuture<B>),
    /// The right side finished first.
    Right(CancelableFuture<A>, B),
}

/// One-shot completion handle passed to [`Task::create`] registrations.
///
/// Exactly one of the consuming methods must eventually be called, unless
/// the registration parks a cancel action on the context's cancellation
/// stack and the run is cancelled first.
pub struct AsyncCallback<A> {
    restart: run_loop::Restart,
    _marker: PhantomData<fn(A)>,
}

impl<A: Value> AsyncCallback<A> {
    pub fn succeed(self, value: A) {
        self.restart.signal(Ok(erase(value)));
    }

    pub fn fail(self, error: Fault) {
        self.restart.signal(Err(error));
    }

    pub fn complete(self, result: Result<A, Fault>) {
        self.restart.signal(result.map(erase));
    }
}

impl<A: Value> Task<A> {
    pub(crate) fn from_raw(raw: Raw) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// An already-completed success.
    pub fn pure(value: A) -> Self {
        Task::from_raw(Raw::Pure(erase(value)))
    }

    /// An already-completed failure.
    pub fn fail(error: impl Into<Fault>) -> Self {
        Task::from_raw(Raw::Fail(error.into()))
    }

    /// Defers a side effect; it re-runs on every evaluation.
    pub fn eval(thunk: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::Eval(Arc::new(move || Ok(erase(thunk())))))
    }

    /// Defers a fallible side effect.
    pub fn eval_result(thunk: impl Fn() -> Result<A, Fault> + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::Eval(Arc::new(move || thunk().map(erase))))
    }

    /// Defers a side effect whose first outcome is latched: later runs (and
    /// clones) observe the cached result instead of re-running the thunk.
    pub fn eval_once(thunk: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::EvalOnce(Arc::new(raw::OnceThunk::new(Arc::new(
            move || Ok(erase(thunk())),
        )))))
    }

    /// Lazily builds another task; the factory runs on every evaluation.
    pub fn suspend(factory: impl Fn() -> Task<A> + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::Suspend(Arc::new(move || factory().raw)))
    }

    /// A task that never completes and registers no cleanup.
    pub fn never() -> Self {
        Task::create(|_, callback: AsyncCallback<A>| drop(callback))
    }

    /// Wraps a callback-registration shape into a task.
    ///
    /// The registration receives the live run [`Context`] and a one-shot
    /// [`AsyncCallback`]; it must eventually invoke the callback or park a
    /// cancel action on the context's cancellation stack.
    pub fn create(register: impl Fn(&Context, AsyncCallback<A>) + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::Async {
            register: Arc::new(move |ctx: &Context, restart: run_loop::Restart| {
                register(
                    ctx,
                    AsyncCallback {
                        restart,
                        _marker: PhantomData,
                    },
                )
            }),
        })
    }

    /// Lifts a future into a task. The future is polled on the run's
    /// executor; cancelling the run drops it.
    ///
    /// A future is a one-shot value, so only the first run of the resulting
    /// task can complete from it; later runs fail. Use
    /// [`Task::defer_future`] for a re-runnable lift.
    pub fn from_future<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<A, Fault>> + Send + 'static,
    {
        let slot: Arc<parking_lot::Mutex<Option<interop::BoxedFuture<A>>>> =
            Arc::new(parking_lot::Mutex::new(Some(Box::pin(future))));
        Task::create(move |ctx, callback| {
            let future = slot.lock().take();
            match future {
                Some(future) => interop::drive(ctx, future, callback),
                None => {
                    callback.fail(Fault::message("future already consumed by an earlier run"))
                }
            }
        })
    }

    /// Re-runnable future lift: the factory builds a fresh future per run.
    pub fn defer_future<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<A, Fault>> + Send + 'static,
    {
        Task::create(move |ctx, callback| interop::drive(ctx, Box::pin(factory()), callback))
    }

    /// Transforms the result. Adjacent maps fuse into a single frame up to
    /// an internal bound, so long chains stay cheap.
    pub fn map<B: Value>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Task<B> {
        let g: raw::MapFn = Arc::new(move |value| Ok(erase(f(unerase::<A>(value)))));
        let raw = match self.raw {
            Raw::Map { source, f: prev, fused } if fused < MAP_FUSION_MAX => Raw::Map {
                source,
                f: Arc::new(move |value| prev(value).and_then(|v| g(v))),
                fused: fused + 1,
            },
            other => Raw::Map {
                source: Box::new(other),
                f: g,
                fused: 0,
            },
        };
        Task::from_raw(raw)
    }

    /// Monadic sequencing: feed the result into a continuation producing the
    /// next task.
    pub fn flat_map<B: Value>(
        self,
        f: impl Fn(A) -> Task<B> + Send + Sync + 'static,
    ) -> Task<B> {
        Task::from_raw(Raw::Bind {
            source: Box::new(self.raw),
            cont: Arc::new(move |value| f(unerase::<A>(value)).raw),
        })
    }

    /// Recovers from a failure with a fallback task. Successes pass through
    /// untouched.
    pub fn recover_with(self, handler: impl Fn(Fault) -> Task<A> + Send + Sync + 'static) -> Self {
        Task::from_raw(Raw::Recover {
            source: Box::new(self.raw),
            handler: Arc::new(move |fault| handler(fault).raw),
        })
    }

    /// Recovers from a failure with a pure fallback value.
    pub fn recover(self, handler: impl Fn(Fault) -> A + Send + Sync + 'static) -> Self {
        self.recover_with(move |fault| Task::pure(handler(fault)))
    }

    /// Materializes the failure channel into the value.
    pub fn attempt(self) -> Task<Result<A, Fault>> {
        self.map(|value| Ok(value)).recover(|error| Err(error))
    }

    /// Observes completion (success or failure) without changing it.
    pub fn do_on_finish(self, observe: impl Fn(Option<&Fault>) + Send + Sync + 'static) -> Self {
        let observe = Arc::new(observe);
        let on_success = Arc::clone(&observe);
        self.flat_map(move |value| {
            on_success(None);
            Task::pure(value)
        })
        .recover_with(move |error| {
            observe(Some(&error));
            Task::fail(error)
        })
    }

    /// Runs `finalizer` (through the executor) if the run is cancelled
    /// before this task completes. A source that already completed, with a
    /// value or a failure, never triggers the finalizer.
    pub fn do_on_cancel(self, finalizer: Task<()>) -> Self {
        Task::from_raw(Raw::OnCancel {
            source: Box::new(self.raw),
            finalizer: Box::new(finalizer.raw),
        })
    }

    /// Retries the task from scratch up to `retries` times on failure.
    pub fn on_error_restart(self, retries: u64) -> Self {
        fn next_round<A: Value>(source: Task<A>, remaining: u64) -> Task<A> {
            let again = source.clone();
            source.recover_with(move |error| {
                if remaining > 0 {
                    let source = again.clone();
                    Task::suspend(move || next_round(source.clone(), remaining - 1))
                } else {
                    Task::fail(error)
                }
            })
        }
        next_round(self, retries)
    }

    /// Shares a single evaluation between every run and clone: the first run
    /// is elected to execute, everyone else subscribes to its outcome.
    /// Failures are cached like successes.
    pub fn memoize(self) -> Self {
        self.memo_with(true)
    }

    /// Like [`Task::memoize`], but a failure resets the cell so the next run
    /// retries the computation.
    pub fn memoize_on_success(self) -> Self {
        self.memo_with(false)
    }

    fn memo_with(self, cache_faults: bool) -> Self {
        match self.raw {
            raw @ (Raw::Pure(_) | Raw::Fail(_)) => Task::from_raw(raw),
            Raw::Memo(cell) if cell.cache_faults() == cache_faults => {
                Task::from_raw(Raw::Memo(cell))
            }
            raw => Task::from_raw(Raw::Memo(Arc::new(MemoCell::new(raw, cache_faults)))),
        }
    }

    /// Swaps the executor for the remainder of the run; with `force_async`
    /// the continuation is re-submitted through the new executor first.
    pub fn execute_on(self, executor: ExecutorRef, force_async: bool) -> Self {
        Task::from_raw(Raw::ExecOn {
            source: Box::new(self.raw),
            executor,
            force_async,
        })
    }

    /// Locally adjusts the run options.
    pub fn with_options(
        self,
        transform: impl Fn(Options) -> Options + Send + Sync + 'static,
    ) -> Self {
        Task::from_raw(Raw::WithOptions {
            source: Box::new(self.raw),
            transform: Arc::new(transform),
        })
    }

    /// Locally overrides the batching model.
    pub fn with_model(self, model: ExecModel) -> Self {
        Task::from_raw(Raw::WithModel {
            source: Box::new(self.raw),
            model,
        })
    }

    /// Races this task against `other`; the winner's value is delivered
    /// together with a handle to the still-running loser.
    pub fn select_either<B: Value>(self, other: Task<B>) -> Task<FirstOf<A, B>> {
        race::select_either(self, other)
    }

    /// Races two tasks of the same type and cancels the loser.
    pub fn race(self, other: Task<A>) -> Task<A> {
        self.select_either(other).map(|first| match first {
            FirstOf::Left(value, loser) => {
                loser.cancel();
                value
            }
            FirstOf::Right(loser, value) => {
                loser.cancel();
                value
            }
        })
    }

    /// Runs both tasks concurrently and combines their results. The first
    /// failure cancels the sibling and becomes the outcome.
    pub fn zip_par_with<B: Value, C: Value>(
        self,
        other: Task<B>,
        combine: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Task<C> {
        zip::zip_par_with(self, other, combine)
    }

    /// Runs both tasks concurrently and pairs their results.
    pub fn zip_par<B: Value>(self, other: Task<B>) -> Task<(A, B)> {
        self.zip_par_with(other, |a, b| (a, b))
    }

    /// Runs the task, delivering the outcome to `callback`. The returned
    /// handle cancels the run.
    ///
    /// The run advances on the caller's thread until it suspends, yields or
    /// completes; the callback fires on whichever thread produces the final
    /// value.
    pub fn run_async(
        self,
        executor: &ExecutorRef,
        options: Options,
        callback: impl Callback<A> + 'static,
    ) -> CancelHandle {
        let ctx = Context::new(executor.clone(), options);
        let handle = CancelHandle::new(ctx.connection().clone());
        let sink = SafeCallback::from_callback::<A, _>(executor.clone(), callback);
        run_loop::start(self.raw, ctx, sink);
        handle
    }

    /// Runs the task, returning a future over its outcome.
    pub fn run_future(self, executor: &ExecutorRef, options: Options) -> CancelableFuture<A> {
        let ctx = Context::new(executor.clone(), options);
        let handle = CancelHandle::new(ctx.connection().clone());
        let (future, promise) = CancelableFuture::pending(handle);
        let sink = SafeCallback::new(executor.clone(), move |result| {
            promise.complete(result.map(unerase::<A>));
        });
        run_loop::start(self.raw, ctx, sink);
        future
    }

    /// Runs as much of the task as possible on the caller's thread.
    ///
    /// Returns the value when the run completed synchronously; otherwise the
    /// run spills into the asynchronous machinery and the pending future is
    /// returned. A synchronous failure comes back as an already-failed
    /// future.
    pub fn run_sync_maybe(self, executor: &ExecutorRef) -> Result<A, CancelableFuture<A>> {
        let ctx = Context::new(executor.clone(), Options::from_env());
        let handle = CancelHandle::new(ctx.connection().clone());
        match run_loop::step(self.raw, ctx) {
            SyncStep::Done(Ok(value)) => Ok(unerase::<A>(value)),
            SyncStep::Done(Err(fault)) => Err(CancelableFuture::completed(Err(fault), handle)),
            SyncStep::Suspended(cursor, ctx, regs, frame) => {
                let (future, promise) = CancelableFuture::pending(handle);
                let sink = SafeCallback::new(ctx.executor().clone(), move |result| {
                    promise.complete(result.map(unerase::<A>));
                });
                run_loop::execute(cursor, ctx, sink, regs, frame);
                Err(future)
            }
        }
    }
}

impl<A: Value> Task<Task<A>> {
    /// Collapses one level of nesting.
    pub fn flatten(self) -> Task<A> {
        self.flat_map(|task| task)
    }
}


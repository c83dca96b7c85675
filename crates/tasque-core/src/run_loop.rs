//! The trampolined evaluator that drives a description tree to completion.
//!
//! One run owns three registers: the node under dispatch, the most recent
//! pending continuation, and a lazily allocated stack of older ones. All
//! recursion is flattened into this explicit stack, so arbitrarily deep bind
//! chains evaluate in constant native stack space. The frame counter bounds
//! how many reductions happen synchronously before the run yields back to
//! its executor.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::callback::SafeCallback;
use crate::cancel::finalizer_action;
use crate::context::Context;
use crate::fault::Fault;
use crate::raw::{protect, BindFn, MapFn, Raw, RecoverFn, Val};

/// A pending continuation on the bind stack.
pub(crate) enum Frame {
    Bind(BindFn),
    Map(MapFn),
    Recover(RecoverFn),
    /// Bookkeeping frame pushed by `OnCancel`: the registered cancel action
    /// is popped when either a success or a failure passes through, so a
    /// finalizer never runs for a source that already completed.
    PopCancel,
}

/// `bind_first` plus the lazily allocated `bind_rest` stack.
#[derive(Default)]
pub(crate) struct Registers {
    first: Option<Frame>,
    rest: Option<SmallVec<[Frame; 8]>>,
}

impl Registers {
    fn push(&mut self, frame: Frame) {
        if let Some(previous) = self.first.take() {
            self.rest.get_or_insert_with(SmallVec::new).push(previous);
        }
        self.first = Some(frame);
    }

    fn pop(&mut self) -> Option<Frame> {
        self.first
            .take()
            .or_else(|| self.rest.as_mut().and_then(|rest| rest.pop()))
    }
}

/// What the dispatch register currently holds: a node still to be reduced,
/// or an already-produced outcome travelling up the bind stack.
pub(crate) enum Cursor {
    Node(Raw),
    Ready(Val),
    Faulted(Fault),
}

fn cursor_from(result: Result<Val, Fault>) -> Cursor {
    match result {
        Ok(value) => Cursor::Ready(value),
        Err(fault) => Cursor::Faulted(fault),
    }
}

/// Begins a fresh run of `raw` on the caller's thread.
pub(crate) fn start(raw: Raw, ctx: Context, sink: SafeCallback) {
    let frame = ctx.model().start_frame();
    execute(Cursor::Node(raw), ctx, sink, Registers::default(), frame);
}

/// Starts a child run through a real asynchronous hop, delivering its erased
/// outcome to `on_done`.
pub(crate) fn spawn(
    raw: Raw,
    ctx: Context,
    on_done: impl FnOnce(Result<Val, Fault>) + Send + 'static,
) {
    let sink = SafeCallback::new(ctx.executor.clone(), on_done);
    let executor = ctx.executor.clone();
    executor.execute_async(Box::new(move || start(raw, ctx, sink)));
}

/// The dispatch loop. Every arm either rewrites the registers and continues,
/// or transfers control (yield, suspension, completion) and returns.
pub(crate) fn execute(
    mut cursor: Cursor,
    mut ctx: Context,
    sink: SafeCallback,
    mut regs: Registers,
    mut frame: usize,
) {
    loop {
        if frame == 0 {
            // Batch exhausted (or an always-async model): hand the
            // continuation to the executor and resume with a fresh budget.
            log::trace!("run yields to the executor");
            let executor = ctx.executor.clone();
            executor.execute_async(Box::new(move || execute(cursor, ctx, sink, regs, 1)));
            return;
        }
        match cursor {
            Cursor::Ready(value) => match regs.pop() {
                None => {
                    deliver_success(&ctx, &sink, value);
                    return;
                }
                Some(Frame::Bind(cont)) => {
                    if polls_cancelled(&ctx) {
                        return;
                    }
                    frame = ctx.model().next_frame(frame);
                    cursor = match protect(|| cont(value)) {
                        Ok(next) => Cursor::Node(next),
                        Err(fault) => Cursor::Faulted(fault),
                    };
                }
                Some(Frame::Map(f)) => {
                    if polls_cancelled(&ctx) {
                        return;
                    }
                    frame = ctx.model().next_frame(frame);
                    cursor = cursor_from(protect(|| f(value)).and_then(|r| r));
                }
                Some(Frame::Recover(_)) => {
                    // Error handlers are transparent to successes.
                    cursor = Cursor::Ready(value);
                }
                Some(Frame::PopCancel) => {
                    ctx.connection.pop();
                    cursor = Cursor::Ready(value);
                }
            },
            Cursor::Faulted(fault) => match regs.pop() {
                None => {
                    deliver_error(&ctx, &sink, fault);
                    return;
                }
                Some(Frame::Recover(handler)) => {
                    if polls_cancelled(&ctx) {
                        return;
                    }
                    frame = ctx.model().next_frame(frame);
                    cursor = match protect(|| handler(fault)) {
                        Ok(next) => Cursor::Node(next),
                        Err(second) => Cursor::Faulted(second),
                    };
                }
                Some(Frame::PopCancel) => {
                    ctx.connection.pop();
                    cursor = Cursor::Faulted(fault);
                }
                Some(_) => {
                    // Success-only continuations are skipped on failure.
                    cursor = Cursor::Faulted(fault);
                }
            },
            Cursor::Node(raw) => match raw {
                Raw::Pure(value) => cursor = Cursor::Ready(value),
                Raw::Fail(fault) => cursor = Cursor::Faulted(fault),
                Raw::Eval(thunk) => {
                    cursor = cursor_from(protect(|| thunk()).and_then(|r| r));
                }
                Raw::EvalOnce(once) => cursor = cursor_from(once.force()),
                Raw::Suspend(build) => {
                    cursor = match protect(|| build()) {
                        Ok(next) => Cursor::Node(next),
                        Err(fault) => Cursor::Faulted(fault),
                    };
                }
                Raw::Bind { source, cont } => {
                    regs.push(Frame::Bind(cont));
                    cursor = Cursor::Node(*source);
                }
                Raw::Map { source, f, .. } => {
                    regs.push(Frame::Map(f));
                    cursor = Cursor::Node(*source);
                }
                Raw::Recover { source, handler } => {
                    regs.push(Frame::Recover(handler));
                    cursor = Cursor::Node(*source);
                }
                Raw::Async { register } => {
                    if ctx.connection.is_cancelled() {
                        log::trace!("run observed cancellation at a suspension point");
                        return;
                    }
                    ctx.frame_ref.store(frame, Ordering::Release);
                    let restart = Restart::new(&ctx, std::mem::take(&mut regs), sink);
                    let recovery = restart.clone();
                    if let Err(fault) = protect(|| register(&ctx, restart)) {
                        recovery.signal(Err(fault));
                    }
                    return;
                }
                Raw::Memo(cell) => {
                    if let Some(result) = cell.peek() {
                        cursor = cursor_from(result);
                    } else {
                        ctx.frame_ref.store(frame, Ordering::Release);
                        let restart = Restart::new(&ctx, std::mem::take(&mut regs), sink);
                        crate::memo::dispatch(cell, &ctx, restart);
                        return;
                    }
                }
                Raw::ExecOn {
                    source,
                    executor,
                    force_async,
                } => {
                    ctx.executor = executor;
                    cursor = Cursor::Node(*source);
                    if force_async {
                        let executor = ctx.executor.clone();
                        executor
                            .execute_async(Box::new(move || execute(cursor, ctx, sink, regs, 1)));
                        return;
                    }
                }
                Raw::WithOptions { source, transform } => {
                    match protect(|| transform(ctx.options)) {
                        Ok(options) => {
                            ctx.options = options;
                            cursor = Cursor::Node(*source);
                        }
                        Err(fault) => cursor = Cursor::Faulted(fault),
                    }
                }
                Raw::WithModel { source, model } => {
                    ctx.model_override = Some(model);
                    cursor = Cursor::Node(*source);
                }
                Raw::OnCancel { source, finalizer } => {
                    let action =
                        finalizer_action(*finalizer, ctx.executor.clone(), ctx.options);
                    ctx.connection.push(action);
                    regs.push(Frame::PopCancel);
                    cursor = Cursor::Node(*source);
                }
            },
        }
    }
}

fn polls_cancelled(ctx: &Context) -> bool {
    if ctx.options.auto_cancelable_binds && ctx.connection.is_cancelled() {
        log::trace!("run observed cancellation between binds");
        return true;
    }
    false
}

fn deliver_success(ctx: &Context, sink: &SafeCallback, value: Val) {
    if ctx.connection.is_cancelled() {
        log::trace!("dropping success produced after cancellation");
        return;
    }
    sink.complete(Ok(value));
}

fn deliver_error(ctx: &Context, sink: &SafeCallback, fault: Fault) {
    if ctx.connection.is_cancelled() {
        ctx.executor.report_failure(fault);
        return;
    }
    sink.complete(Err(fault));
}

/// Saved registers of a run suspended on an asynchronous node.
struct ResumeState {
    ctx: Context,
    regs: Registers,
    sink: SafeCallback,
}

/// The at-most-once continuation handed to asynchronous registrations.
///
/// Signalling it re-enters the dispatch loop through a light executor hop,
/// with the frame index recorded at suspension time. A second signal finds
/// the slot empty and is routed to the executor's failure reporter.
#[derive(Clone)]
pub struct Restart {
    slot: Arc<Mutex<Option<ResumeState>>>,
    executor: crate::executor::ExecutorRef,
}

impl Restart {
    pub(crate) fn new(ctx: &Context, regs: Registers, sink: SafeCallback) -> Self {
        Self {
            executor: ctx.executor.clone(),
            slot: Arc::new(Mutex::new(Some(ResumeState {
                ctx: ctx.clone(),
                regs,
                sink,
            }))),
        }
    }

    pub(crate) fn signal(&self, result: Result<Val, Fault>) {
        let state = self.slot.lock().take();
        match state {
            Some(resume) => {
                if resume.ctx.connection.is_cancelled() {
                    match result {
                        Ok(_) => log::trace!("dropping completion of a cancelled suspension"),
                        Err(fault) => resume.ctx.executor.report_failure(fault),
                    }
                    return;
                }
                let frame = resume.ctx.frame_ref.load(Ordering::Acquire).max(1);
                let executor = resume.ctx.executor.clone();
                executor.execute_trampolined(Box::new(move || {
                    execute(
                        cursor_from(result),
                        resume.ctx,
                        resume.sink,
                        resume.regs,
                        frame,
                    )
                }));
            }
            None => match result {
                Ok(_) => self.executor.report_failure(Fault::message(
                    "async registration completed more than once",
                )),
                Err(fault) => self.executor.report_failure(fault),
            },
        }
    }
}

/// Outcome of the synchronous stepping loop behind `run_sync_maybe`.
pub(crate) enum SyncStep {
    Done(Result<Val, Fault>),
    Suspended(Cursor, Context, Registers, usize),
}

/// Reduces purely synchronous nodes on the caller's thread and stops at the
/// first node that needs the asynchronous machinery. The suspended registers
/// feed [`execute`] unchanged, so the spilled run continues exactly where
/// the synchronous walk left off.
pub(crate) fn step(raw: Raw, mut ctx: Context) -> SyncStep {
    let mut cursor = Cursor::Node(raw);
    let mut regs = Registers::default();
    let mut frame = ctx.model().start_frame();
    loop {
        if frame == 0 {
            return SyncStep::Suspended(cursor, ctx, regs, frame);
        }
        match cursor {
            Cursor::Ready(value) => match regs.pop() {
                None => return SyncStep::Done(Ok(value)),
                Some(Frame::Bind(cont)) => {
                    frame = ctx.model().next_frame(frame);
                    cursor = match protect(|| cont(value)) {
                        Ok(next) => Cursor::Node(next),
                        Err(fault) => Cursor::Faulted(fault),
                    };
                }
                Some(Frame::Map(f)) => {
                    frame = ctx.model().next_frame(frame);
                    cursor = cursor_from(protect(|| f(value)).and_then(|r| r));
                }
                Some(Frame::Recover(_)) => cursor = Cursor::Ready(value),
                Some(Frame::PopCancel) => {
                    ctx.connection.pop();
                    cursor = Cursor::Ready(value);
                }
            },
            Cursor::Faulted(fault) => match regs.pop() {
                None => return SyncStep::Done(Err(fault)),
                Some(Frame::Recover(handler)) => {
                    frame = ctx.model().next_frame(frame);
                    cursor = match protect(|| handler(fault)) {
                        Ok(next) => Cursor::Node(next),
                        Err(second) => Cursor::Faulted(second),
                    };
                }
                Some(Frame::PopCancel) => {
                    ctx.connection.pop();
                    cursor = Cursor::Faulted(fault);
                }
                Some(_) => cursor = Cursor::Faulted(fault),
            },
            Cursor::Node(raw) => match raw {
                Raw::Pure(value) => cursor = Cursor::Ready(value),
                Raw::Fail(fault) => cursor = Cursor::Faulted(fault),
                Raw::Eval(thunk) => cursor = cursor_from(protect(|| thunk()).and_then(|r| r)),
                Raw::EvalOnce(once) => cursor = cursor_from(once.force()),
                Raw::Suspend(build) => {
                    cursor = match protect(|| build()) {
                        Ok(next) => Cursor::Node(next),
                        Err(fault) => Cursor::Faulted(fault),
                    };
                }
                Raw::Bind { source, cont } => {
                    regs.push(Frame::Bind(cont));
                    cursor = Cursor::Node(*source);
                }
                Raw::Map { source, f, .. } => {
                    regs.push(Frame::Map(f));
                    cursor = Cursor::Node(*source);
                }
                Raw::Recover { source, handler } => {
                    regs.push(Frame::Recover(handler));
                    cursor = Cursor::Node(*source);
                }
                node @ (Raw::Async { .. } | Raw::Memo(_)) => {
                    if let Raw::Memo(cell) = &node {
                        if let Some(result) = cell.peek() {
                            cursor = cursor_from(result);
                            continue;
                        }
                    }
                    return SyncStep::Suspended(Cursor::Node(node), ctx, regs, frame);
                }
                Raw::ExecOn {
                    source,
                    executor,
                    force_async,
                } => {
                    ctx.executor = executor;
                    cursor = Cursor::Node(*source);
                    if force_async {
                        // Spill with an exhausted frame so the asynchronous
                        // loop immediately hops onto the new executor.
                        return SyncStep::Suspended(cursor, ctx, regs, 0);
                    }
                }
                Raw::WithOptions { source, transform } => {
                    match protect(|| transform(ctx.options)) {
                        Ok(options) => {
                            ctx.options = options;
                            cursor = Cursor::Node(*source);
                        }
                        Err(fault) => cursor = Cursor::Faulted(fault),
                    }
                }
                Raw::WithModel { source, model } => {
                    ctx.model_override = Some(model);
                    cursor = Cursor::Node(*source);
                }
                Raw::OnCancel { source, finalizer } => {
                    let action =
                        finalizer_action(*finalizer, ctx.executor.clone(), ctx.options);
                    ctx.connection.push(action);
                    regs.push(Frame::PopCancel);
                    cursor = Cursor::Node(*source);
                }
            },
        }
    }
}

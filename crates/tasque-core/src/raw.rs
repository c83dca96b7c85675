//! The type-erased description tree behind [`Task`](crate::Task).
//!
//! The typed facade erases values into clonable `dyn Any` boxes so the
//! run-loop can thread heterogeneous intermediate results through one
//! non-generic dispatch. Downcasts happen at exactly two seams: applying a
//! continuation and delivering to the outer callback; the typed constructors
//! guarantee they cannot fail.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::Context;
use crate::executor::{ExecModel, ExecutorRef};
use crate::fault::Fault;
use crate::memo::MemoCell;
use crate::options::Options;
use crate::run_loop::Restart;

/// Clone-capable erased value, the currency of the run-loop.
pub(crate) type Val = Box<dyn ErasedValue>;

pub(crate) trait ErasedValue: Send + Sync {
    fn boxed_clone(&self) -> Val;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Clone + Send + Sync + 'static> ErasedValue for T {
    fn boxed_clone(&self) -> Val {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl Clone for Val {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

pub(crate) fn erase<A: Clone + Send + Sync + 'static>(value: A) -> Val {
    Box::new(value)
}

pub(crate) fn unerase<A: Clone + Send + Sync + 'static>(value: Val) -> A {
    *value
        .into_any()
        .downcast::<A>()
        .expect("erased task value type mismatch")
}

pub(crate) type Thunk = Arc<dyn Fn() -> Result<Val, Fault> + Send + Sync>;
pub(crate) type BindFn = Arc<dyn Fn(Val) -> Raw + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(Val) -> Result<Val, Fault> + Send + Sync>;
pub(crate) type RecoverFn = Arc<dyn Fn(Fault) -> Raw + Send + Sync>;
pub(crate) type RegisterFn = Arc<dyn Fn(&Context, Restart) + Send + Sync>;
pub(crate) type OptionsFn = Arc<dyn Fn(Options) -> Options + Send + Sync>;

/// Adjacent `Map` layers fuse into one closure up to this bound, so long map
/// chains stay cheap without ever building one unboundedly expensive frame.
pub(crate) const MAP_FUSION_MAX: u32 = 127;

#[derive(Clone)]
pub(crate) enum Raw {
    Pure(Val),
    Fail(Fault),
    Eval(Thunk),
    EvalOnce(Arc<OnceThunk>),
    Suspend(Arc<dyn Fn() -> Raw + Send + Sync>),
    Bind {
        source: Box<Raw>,
        cont: BindFn,
    },
    Map {
        source: Box<Raw>,
        f: MapFn,
        fused: u32,
    },
    Recover {
        source: Box<Raw>,
        handler: RecoverFn,
    },
    Async {
        register: RegisterFn,
    },
    Memo(Arc<MemoCell>),
    ExecOn {
        source: Box<Raw>,
        executor: ExecutorRef,
        force_async: bool,
    },
    WithOptions {
        source: Box<Raw>,
        transform: OptionsFn,
    },
    WithModel {
        source: Box<Raw>,
        model: ExecModel,
    },
    OnCancel {
        source: Box<Raw>,
        finalizer: Box<Raw>,
    },
}

/// Deferred side effect whose first outcome, success or failure, is latched
/// and replayed to every later observer.
pub(crate) struct OnceThunk {
    thunk: Thunk,
    cell: std::sync::OnceLock<Result<Val, Fault>>,
}

impl OnceThunk {
    pub(crate) fn new(thunk: Thunk) -> Self {
        Self {
            thunk,
            cell: std::sync::OnceLock::new(),
        }
    }

    pub(crate) fn force(&self) -> Result<Val, Fault> {
        self.cell
            .get_or_init(|| protect(|| (self.thunk)()).and_then(|r| r))
            .clone()
    }
}

/// Runs a user-supplied closure, converting panics into faults so they flow
/// through the ordinary failure channel.
pub(crate) fn protect<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Fault::from_panic)
}

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::cancel::CancelStack;
use crate::executor::{ExecModel, ExecutorRef};
use crate::options::Options;

/// Mutable integer cell carrying the frame index across light hops.
pub(crate) type FrameRef = Arc<AtomicUsize>;

/// Per-run bundle handed to the run-loop and to asynchronous registrations.
///
/// A `Context` is created fresh by each run entry point and never shared
/// between runs; cloning it shares the cancellation stack and frame cell of
/// the same run.
#[derive(Clone)]
pub struct Context {
    pub(crate) executor: ExecutorRef,
    pub(crate) connection: CancelStack,
    pub(crate) frame_ref: FrameRef,
    pub(crate) options: Options,
    pub(crate) model_override: Option<ExecModel>,
}

impl Context {
    pub(crate) fn new(executor: ExecutorRef, options: Options) -> Self {
        Self {
            executor,
            connection: CancelStack::new(),
            frame_ref: Arc::new(AtomicUsize::new(1)),
            options,
            model_override: None,
        }
    }

    /// The executor this run currently submits work through.
    pub fn executor(&self) -> &ExecutorRef {
        &self.executor
    }

    /// The cancellation stack of this run. Asynchronous registrations push
    /// their cleanup here and pop it when they complete normally.
    pub fn connection(&self) -> &CancelStack {
        &self.connection
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Effective execution model: a local override when present, otherwise
    /// whatever the executor advertises.
    pub fn model(&self) -> ExecModel {
        self.model_override
            .unwrap_or_else(|| self.executor.execution_model())
    }

    /// Derives the context for one side of a forked run: same executor and
    /// options, its own cancellation stack and frame cell.
    pub(crate) fn fork(&self, connection: CancelStack) -> Self {
        Self {
            executor: self.executor.clone(),
            connection,
            frame_ref: Arc::new(AtomicUsize::new(1)),
            options: self.options,
            model_override: self.model_override,
        }
    }
}

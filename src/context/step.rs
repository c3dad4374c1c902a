//! Step handlers and the bookkeeping for queued and executed steps.

use super::OperationContext;
use super::stage::Stage;
use crate::error::Result;
use crate::operation::Operation;
use pathaddr::PathAddress;
use std::fmt;
use std::sync::Arc;

/// A unit of work executed by an [`OperationContext`].
///
/// Handlers must finish by calling [`OperationContext::complete_step`] (to
/// observe the outcome of everything that runs after them) or
/// [`OperationContext::complete_step_with`] (to register rollback logic and
/// return at once). Returning an error before completing marks the step
/// failed.
pub trait OperationStepHandler: Send + Sync {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()>;
}

struct FnHandler<F>(F);

impl<F> OperationStepHandler for FnHandler<F>
where
    F: Fn(&mut OperationContext, &Operation) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        (self.0)(ctx, operation)
    }
}

/// Wrap a closure as a step handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn OperationStepHandler>
where
    F: Fn(&mut OperationContext, &Operation) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Logic run when a completed step is finalized under rollback.
pub type RollbackHandler = Box<dyn FnOnce(&mut OperationContext, &Operation) + Send>;

/// Index of a response slot owned by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseId(pub(crate) usize);

/// A queued step.
#[derive(Clone)]
pub(crate) struct Step {
    pub(crate) handler: Arc<dyn OperationStepHandler>,
    pub(crate) operation: Arc<Operation>,
    pub(crate) address: PathAddress,
    pub(crate) response: ResponseId,
}

impl Step {
    pub(crate) fn new(handler: Arc<dyn OperationStepHandler>, operation: Arc<Operation>, response: ResponseId) -> Self {
        let address = operation.address.clone();
        Self {
            handler,
            operation,
            address,
            response,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("operation", &self.operation.name)
            .field("address", &self.address)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// How an executed step was completed.
pub(crate) enum Completion {
    /// Handler is running and has not completed yet
    Pending,
    /// Handler completed via `complete_step` and is still on the call stack
    Recursive,
    /// Handler completed via `complete_step_with` and has returned
    Deferred(Option<RollbackHandler>),
}

/// A step that has started executing and awaits finalization.
pub(crate) struct StepRecord {
    pub(crate) step: Step,
    pub(crate) completion: Completion,
    pub(crate) stage: Stage,
}

impl StepRecord {
    pub(crate) fn is_deferred(&self) -> bool {
        matches!(self.completion, Completion::Deferred(_))
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.completion, Completion::Pending)
    }
}

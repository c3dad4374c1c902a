use super::add::{RuntimeHandler, add_runtime_step};
use crate::context::{OperationContext, OperationStepHandler};
use crate::error::{ControllerError, Result};
use crate::operation::{Operation, names};
use pathaddr::PathAddress;
use std::sync::Arc;

/// Removes a resource that has no children.
///
/// The compensating operation is an `add` carrying the removed attributes.
#[derive(Default)]
pub struct RemoveStepHandler {
    runtime: Option<Arc<dyn RuntimeHandler>>,
}

impl RemoveStepHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeHandler>) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl OperationStepHandler for RemoveStepHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let children = ctx.read_resource(&PathAddress::EMPTY)?.child_types();
        if !children.is_empty() {
            return Err(ControllerError::failed(format!(
                "Cannot remove {} while it has {} children",
                operation.address,
                children.join(", ")
            )));
        }

        let removed = ctx.remove_resource(&PathAddress::EMPTY)?;
        let model = removed.model().clone();
        let mut compensating = Operation::new(names::ADD, operation.address.clone());
        compensating.params = model.clone();
        ctx.set_compensating_operation(compensating);

        if let Some(runtime) = &self.runtime {
            add_runtime_step(ctx, runtime, model)?;
        }
        ctx.step_completed();
        Ok(())
    }
}

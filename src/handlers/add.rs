use crate::attribute::ResourceDefinition;
use crate::context::{OperationContext, OperationStepHandler, Stage, handler_fn};
use crate::error::Result;
use crate::operation::{Operation, names};
use crate::resource::Resource;
use pathaddr::PathAddress;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runtime work for a resource that was added or removed.
///
/// `perform` runs in the RUNTIME stage with the resource's model;
/// `rollback` runs if the operation is later rolled back.
pub trait RuntimeHandler: Send + Sync {
    fn perform(&self, ctx: &mut OperationContext, operation: &Operation, model: &Map<String, Value>) -> Result<()>;

    fn rollback(&self, _ctx: &mut OperationContext, _operation: &Operation, _model: &Map<String, Value>) {}
}

/// Schedule `runtime` for the RUNTIME stage of the current operation.
pub(super) fn add_runtime_step(
    ctx: &mut OperationContext,
    runtime: &Arc<dyn RuntimeHandler>,
    model: Map<String, Value>,
) -> Result<()> {
    let runtime = Arc::clone(runtime);
    let step = handler_fn(move |ctx, operation| {
        runtime.perform(ctx, operation, &model)?;
        let runtime = Arc::clone(&runtime);
        let model = model.clone();
        ctx.complete_step_with(move |ctx, operation| runtime.rollback(ctx, operation, &model));
        Ok(())
    });
    ctx.add_step(step, Stage::Runtime)
}

/// Adds a resource from the operation parameters.
///
/// Parameters are validated against the resource definition; unknown
/// parameters are rejected. The compensating operation is a `remove`.
pub struct AddStepHandler {
    definition: Arc<ResourceDefinition>,
    runtime: Option<Arc<dyn RuntimeHandler>>,
}

impl AddStepHandler {
    pub fn new(definition: ResourceDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeHandler>) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl OperationStepHandler for AddStepHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let mut model = Map::new();
        self.definition.populate(operation, &mut model)?;
        ctx.add_resource(&PathAddress::EMPTY, Resource::with_model(model.clone()))?;
        ctx.set_compensating_operation(Operation::new(names::REMOVE, operation.address.clone()));

        if let Some(runtime) = &self.runtime {
            add_runtime_step(ctx, runtime, model)?;
        }
        ctx.step_completed();
        Ok(())
    }
}

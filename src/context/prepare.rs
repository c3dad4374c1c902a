//! The first step of every submitted operation.

use super::{OperationContext, OperationStepHandler, Stage};
use crate::error::{ControllerError, Result};
use crate::operation::Operation;
use serde_json::{Value, json};
use std::sync::Arc;

/// Resolves the registered handler for the operation and runs it next.
///
/// A read-only operation addressed with wildcards runs once per matching
/// resource; its result is the list of per-address results.
pub(crate) struct PrepareStepHandler;

impl OperationStepHandler for PrepareStepHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let entry = ctx.resolve_step_handler(operation)?;
        if !operation.address.is_multi_target() {
            ctx.add_step(Arc::clone(entry.handler()), Stage::Immediate)?;
            ctx.step_completed();
            return Ok(());
        }

        if !entry.flags().read_only {
            return Err(ControllerError::WriteNotPermitted {
                address: operation.address.clone(),
                reason: "wildcard addresses are only supported by read-only operations",
            });
        }
        expand_multi_target(ctx, operation)
    }
}

fn expand_multi_target(ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
    let targets = ctx.root().matching_addresses(&operation.address);
    let mut steps = Vec::with_capacity(targets.len());
    for address in &targets {
        let target = operation.with_address(address.clone());
        let entry = ctx.resolve_step_handler(&target)?;
        steps.push((ctx.new_response(), target, Arc::clone(entry.handler())));
    }

    let slots: Vec<_> = steps.iter().map(|(slot, target, _)| (*slot, target.address.clone())).collect();
    for (slot, target, handler) in steps.into_iter().rev() {
        ctx.add_step_with_response(slot, target, handler, Stage::Immediate)?;
    }
    ctx.complete_step();

    let results: Vec<Value> = slots
        .into_iter()
        .filter_map(|(slot, address)| {
            let response = ctx.response(slot)?;
            Some(json!({
                "address": address,
                "outcome": response.outcome,
                "result": response.result,
            }))
        })
        .collect();
    ctx.set_result(Value::Array(results));
    Ok(())
}

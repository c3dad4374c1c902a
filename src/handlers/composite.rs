use crate::context::{OperationContext, OperationStepHandler, PrepareStepHandler, ResponseId, Stage};
use crate::error::{ControllerError, Result};
use crate::operation::{Operation, names};
use pathaddr::PathAddress;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runs the operations in the `steps` parameter as one unit.
///
/// Every step is resolved before any of them runs, so an unknown
/// operation fails the composite without side effects. Steps run in
/// order, each with its own response under `step-N` in the result. If
/// any step fails, all of them roll back.
pub struct CompositeOperationHandler;

impl OperationStepHandler for CompositeOperationHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let Some(Value::Array(raw)) = operation.get(names::STEPS) else {
            return Err(ControllerError::InvalidOperation(
                "'steps' must be a list of operations".to_string(),
            ));
        };

        let mut steps = Vec::with_capacity(raw.len());
        for value in raw {
            let step = Operation::from_value(value.clone())?;
            let entry = ctx.resolve_step_handler(&step)?;
            let handler: Arc<dyn OperationStepHandler> = if step.address.is_multi_target() {
                Arc::new(PrepareStepHandler)
            } else {
                Arc::clone(entry.handler())
            };
            steps.push((step, handler));
        }

        let slots: Vec<ResponseId> = steps.iter().map(|_| ctx.new_response()).collect();
        for ((step, handler), slot) in steps.into_iter().zip(&slots).rev() {
            ctx.add_step_with_response(*slot, step, handler, Stage::Immediate)?;
        }
        let action = ctx.complete_step();

        let mut results = Map::new();
        let mut failures = Map::new();
        let mut compensating = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            let Some(response) = ctx.response(*slot) else {
                continue;
            };
            let key = format!("step-{}", index + 1);
            if let Some(description) = &response.failure_description {
                failures.insert(key.clone(), Value::String(description.clone()));
            }
            if let Some(undo) = &response.compensating_operation {
                compensating.push(undo.to_value());
            }
            results.insert(key, response.to_value());
        }
        ctx.set_result(Value::Object(results));

        if action.is_rollback() {
            if !failures.is_empty() {
                ctx.set_failure(format!(
                    "Composite operation failed and was rolled back. Steps that failed: {}",
                    Value::Object(failures)
                ));
            }
        } else if !compensating.is_empty() {
            compensating.reverse();
            ctx.set_compensating_operation(
                Operation::new(names::COMPOSITE, PathAddress::EMPTY).param(names::STEPS, compensating),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::handlers::RemoveStepHandler;
    use crate::operation::{Operation, Outcome, names};
    use crate::registry::OperationFlags;
    use std::sync::Arc;
    use crate::testing::{addr, subsystem_controller};
    use pathaddr::PathAddress;
    use serde_json::json;

    fn composite(steps: serde_json::Value) -> Operation {
        Operation::new(names::COMPOSITE, PathAddress::EMPTY).param(names::STEPS, steps)
    }

    #[test]
    fn test_composite_success() {
        let controller = subsystem_controller();
        let response = controller.execute(composite(json!([
            {"operation": "add", "address": [{"subsystem": "a"}], "value": 1},
            {"operation": "add", "address": [{"subsystem": "b"}], "value": 2},
        ])));
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.result["step-1"]["outcome"], "success");
        assert_eq!(response.result["step-2"]["outcome"], "success");
        assert!(controller.root().contains(&addr("/subsystem=b")));

        let undo = response.compensating_operation.unwrap();
        assert_eq!(undo.name, names::COMPOSITE);
        let steps = undo.get(names::STEPS).unwrap();
        assert_eq!(steps[0]["operation"], "remove");
        assert_eq!(steps[0]["address"], json!([{"subsystem": "b"}]));
    }

    #[test]
    fn test_composite_failure_rolls_back_every_step() {
        let controller = subsystem_controller();
        let response = controller.execute(composite(json!([
            {"operation": "add", "address": [{"subsystem": "a"}], "value": 1},
            {"operation": "add", "address": [{"subsystem": "b"}]},
        ])));
        assert_eq!(response.outcome, Outcome::Failed);
        assert!(response.rolled_back);
        let description = response.failure_description.unwrap();
        assert!(description.starts_with("Composite operation failed and was rolled back"));
        assert!(description.contains("step-2"));
        assert!(!description.contains("step-1"));
        assert_eq!(response.result["step-1"]["rolled-back"], json!(true));
        assert!(response.compensating_operation.is_none());
        assert!(!controller.root().contains(&addr("/subsystem=a")));
    }

    #[test]
    fn test_steps_after_a_failure_report_rollback() {
        let controller = subsystem_controller();
        controller
            .registry()
            .register_operation(
                &addr("/subsystem=*"),
                names::REMOVE,
                Arc::new(RemoveStepHandler::new()),
                OperationFlags::NONE,
            )
            .unwrap();
        let add_c = Operation::new(names::ADD, addr("/subsystem=c")).param("value", 3);
        assert!(controller.execute(add_c).is_success());

        let response = controller.execute(composite(json!([
            {"operation": "add", "address": [{"subsystem": "a"}], "value": 1},
            {"operation": "add", "address": [{"subsystem": "b"}]},
            {"operation": "remove", "address": [{"subsystem": "c"}]},
        ])));
        assert_eq!(response.outcome, Outcome::Failed);
        assert!(response.rolled_back);
        for key in ["step-1", "step-2", "step-3"] {
            assert_ne!(response.result[key]["outcome"], "success", "{key}: {response:?}");
            assert_eq!(response.result[key]["rolled-back"], json!(true), "{key}");
            assert!(response.result[key].get("compensating-operation").is_none(), "{key}");
        }
        let description = response.failure_description.unwrap();
        assert!(description.contains("step-2"));
        assert!(!description.contains("step-3"));

        let root = controller.root();
        assert!(!root.contains(&addr("/subsystem=a")));
        assert!(!root.contains(&addr("/subsystem=b")));
        assert!(root.contains(&addr("/subsystem=c")));
    }

    #[test]
    fn test_composite_requires_step_list() {
        let controller = subsystem_controller();
        let response = controller.execute(Operation::new(names::COMPOSITE, PathAddress::EMPTY));
        assert!(response.failure_description.unwrap().contains("steps"));
    }

    #[test]
    fn test_nested_composite() {
        let controller = subsystem_controller();
        let response = controller.execute(composite(json!([
            {"operation": "composite", "steps": [
                {"operation": "add", "address": [{"subsystem": "inner"}], "value": 1},
            ]},
            {"operation": "read-resource", "address": [{"subsystem": "inner"}]},
        ])));
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.result["step-2"]["result"]["value"], json!(1));
    }
}

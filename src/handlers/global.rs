//! Operations every resource inherits from the root registration.

use super::CompositeOperationHandler;
use crate::attribute::{AttributeDefinition, AttributeFlag};
use crate::context::{OperationContext, OperationStepHandler};
use crate::error::{ControllerError, Result};
use crate::operation::{Operation, names};
use crate::registry::{OperationFlags, OperationRegistry};
use crate::resource::Resource;
use pathaddr::{PathAddress, PathElement};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Register the global operations as inherited operations of the root.
pub fn register_global_operations(registry: &OperationRegistry) -> Result<()> {
    let root = PathAddress::EMPTY;
    let globals: [(&str, Arc<dyn OperationStepHandler>, OperationFlags); 7] = [
        (names::READ_RESOURCE, Arc::new(ReadResourceHandler), OperationFlags::READ_ONLY),
        (names::READ_ATTRIBUTE, Arc::new(ReadAttributeHandler), OperationFlags::READ_ONLY),
        (
            names::WRITE_ATTRIBUTE,
            Arc::new(WriteAttributeHandler { undefine: false }),
            OperationFlags::NONE,
        ),
        (
            names::UNDEFINE_ATTRIBUTE,
            Arc::new(WriteAttributeHandler { undefine: true }),
            OperationFlags::NONE,
        ),
        (names::READ_CHILDREN_NAMES, Arc::new(ReadChildrenNamesHandler), OperationFlags::READ_ONLY),
        (names::READ_CHILDREN_TYPES, Arc::new(ReadChildrenTypesHandler), OperationFlags::READ_ONLY),
        (names::READ_OPERATION_NAMES, Arc::new(ReadOperationNamesHandler), OperationFlags::READ_ONLY),
    ];
    for (name, handler, flags) in globals {
        registry.register_inherited_operation(&root, name, handler, flags)?;
    }
    registry.register_operation(&root, names::COMPOSITE, Arc::new(CompositeOperationHandler), OperationFlags::NONE)
}

// ============================================================================
// Reads
// ============================================================================

/// Renders the resource, optionally with children and defaults.
pub struct ReadResourceHandler;

impl OperationStepHandler for ReadResourceHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let recursive = operation.get_bool(names::RECURSIVE, false)?;
        let include_defaults = operation.get_bool(names::INCLUDE_DEFAULTS, true)?;
        let resource = ctx.read_resource(&PathAddress::EMPTY)?;
        let value = render(ctx.registry(), resource, &operation.address, recursive, include_defaults);
        ctx.set_result(value);
        ctx.step_completed();
        Ok(())
    }
}

fn render(
    registry: &OperationRegistry,
    resource: &Resource,
    address: &PathAddress,
    recursive: bool,
    include_defaults: bool,
) -> Value {
    let mut out = match registry.resource_definition(address) {
        Some(definition) if include_defaults => definition.with_defaults(resource.model()),
        _ => resource.model().clone(),
    };

    let mut types: BTreeSet<String> = registry.child_types(address).into_iter().collect();
    types.extend(resource.child_types());
    for child_type in types {
        let mut entries = Map::new();
        for (name, child) in resource.get_children(&child_type) {
            let rendered = match PathElement::new(child_type.as_str(), name) {
                Ok(element) if recursive => {
                    render(registry, child, &address.append_element(element), true, include_defaults)
                }
                _ => Value::Null,
            };
            entries.insert(name.to_string(), rendered);
        }
        let value = if entries.is_empty() {
            Value::Null
        } else {
            Value::Object(entries)
        };
        out.insert(child_type, value);
    }
    Value::Object(out)
}

/// Reads one attribute, falling back to its default.
pub struct ReadAttributeHandler;

impl OperationStepHandler for ReadAttributeHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let name = operation.require_str(names::NAME)?;
        let include_defaults = operation.get_bool(names::INCLUDE_DEFAULTS, true)?;
        let value = ctx.read_resource(&PathAddress::EMPTY)?.attribute(name).cloned();

        let value = match ctx.resource_definition() {
            Some(definition) => {
                let attribute = lookup(definition.attributes(), name, &operation.address)?;
                value
                    .or_else(|| include_defaults.then(|| attribute.default_value().cloned()).flatten())
                    .unwrap_or(Value::Null)
            }
            None => value.unwrap_or(Value::Null),
        };
        ctx.set_result(value);
        ctx.step_completed();
        Ok(())
    }
}

fn lookup<'a>(attributes: &'a [AttributeDefinition], name: &str, address: &PathAddress) -> Result<&'a AttributeDefinition> {
    attributes
        .iter()
        .find(|a| a.name() == name)
        .ok_or_else(|| ControllerError::UnknownAttribute {
            attribute: name.to_string(),
            address: address.clone(),
        })
}

pub struct ReadChildrenNamesHandler;

impl OperationStepHandler for ReadChildrenNamesHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let child_type = operation.require_str(names::CHILD_TYPE)?;
        let child_names = ctx.read_resource(&PathAddress::EMPTY)?.child_names(child_type);
        ctx.set_result(Value::from(child_names));
        ctx.step_completed();
        Ok(())
    }
}

pub struct ReadChildrenTypesHandler;

impl OperationStepHandler for ReadChildrenTypesHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let mut types: BTreeSet<String> = ctx.registry().child_types(&operation.address).into_iter().collect();
        types.extend(ctx.read_resource(&PathAddress::EMPTY)?.child_types());
        ctx.set_result(Value::from(types.into_iter().collect::<Vec<_>>()));
        ctx.step_completed();
        Ok(())
    }
}

pub struct ReadOperationNamesHandler;

impl OperationStepHandler for ReadOperationNamesHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let names = ctx.registry().operation_names(&operation.address);
        ctx.set_result(Value::from(names));
        ctx.step_completed();
        Ok(())
    }
}

// ============================================================================
// Writes
// ============================================================================

/// `write-attribute` and `undefine-attribute`.
///
/// The value is validated against the attribute definition. Attributes
/// flagged as needing a restart put the process into reload-required or
/// restart-required instead of touching the runtime.
pub struct WriteAttributeHandler {
    undefine: bool,
}

impl OperationStepHandler for WriteAttributeHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let name = operation.require_str(names::NAME)?.to_string();
        let value = if self.undefine {
            Value::Null
        } else {
            operation.get(names::VALUE).cloned().unwrap_or(Value::Null)
        };
        let Some(definition) = ctx.resource_definition() else {
            return Err(ControllerError::UnknownAttribute {
                attribute: name,
                address: operation.address.clone(),
            });
        };
        let attribute = lookup(definition.attributes(), &name, &operation.address)?.clone();

        let resource = ctx.read_resource_for_update(&PathAddress::EMPTY)?;
        let old = definition.write_value(&attribute, value, resource.model_mut())?;

        let compensating = if old.is_null() {
            Operation::new(names::UNDEFINE_ATTRIBUTE, operation.address.clone()).param(names::NAME, name.clone())
        } else {
            Operation::new(names::WRITE_ATTRIBUTE, operation.address.clone())
                .param(names::NAME, name.clone())
                .param(names::VALUE, old)
        };
        ctx.set_compensating_operation(compensating);

        if attribute.has_flag(AttributeFlag::RestartJvm) {
            ctx.restart_required();
        } else if attribute.has_flag(AttributeFlag::RestartAllServices) {
            ctx.reload_required();
        } else if attribute.has_flag(AttributeFlag::RestartResourceServices) {
            let address = operation.address.clone();
            if ctx.is_resource_service_restart_allowed() && ctx.mark_resource_restarted(address.clone(), &name) {
                ctx.complete_step_with(move |ctx, _| {
                    ctx.revert_resource_restarted(&address, &name);
                });
                return Ok(());
            }
            ctx.reload_required();
        }

        ctx.complete_step_with(|ctx, _| {
            ctx.revert_reload_required();
            ctx.revert_restart_required();
        });
        Ok(())
    }
}

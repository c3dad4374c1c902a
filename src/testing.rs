//! Test fixtures shared across modules.

use crate::attribute::{AttributeDefinition, ResourceDefinition, ValueType};
use crate::controller::{ControllerBuilder, ModelController};
use crate::handlers::{AddStepHandler, RuntimeHandler};
use crate::operation::names;
use crate::registry::OperationFlags;
use pathaddr::PathAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use txkit::{LockObserver, Permit};

pub(crate) fn addr(s: &str) -> PathAddress {
    s.parse().unwrap()
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build the controller and register the global operations.
pub(crate) fn controller_with(builder: ControllerBuilder) -> ModelController {
    init_logging();
    let controller = builder.build().unwrap();
    controller.register_global_operations().unwrap();
    controller
}

/// Register `/subsystem=*` with a required integer `value` and an `add`.
pub(crate) fn register_subsystem(controller: &ModelController, runtime: Option<Arc<dyn RuntimeHandler>>) {
    let definition = ResourceDefinition::new(vec![AttributeDefinition::simple("value", ValueType::Int).build()]);
    let pattern = addr("/subsystem=*");
    let mut add = AddStepHandler::new(definition.clone());
    if let Some(runtime) = runtime {
        add = add.with_runtime(runtime);
    }
    controller.registry().register_resource(&pattern, definition).unwrap();
    controller
        .registry()
        .register_operation(&pattern, names::ADD, Arc::new(add), OperationFlags::NONE)
        .unwrap();
}

pub(crate) fn subsystem_controller() -> ModelController {
    let controller = controller_with(ModelController::builder());
    register_subsystem(&controller, None);
    controller
}

/// Records the interval during which each permit held the lock.
#[derive(Default)]
pub(crate) struct IntervalObserver {
    open: Mutex<HashMap<Permit, Instant>>,
    closed: Mutex<Vec<(Instant, Instant)>>,
}

impl IntervalObserver {
    /// Closed intervals ordered by start.
    pub(crate) fn intervals(&self) -> Vec<(Instant, Instant)> {
        let mut intervals = self.closed.lock().unwrap().clone();
        intervals.sort();
        intervals
    }
}

impl LockObserver for IntervalObserver {
    fn acquired(&self, permit: Permit) {
        self.open.lock().unwrap().insert(permit, Instant::now());
    }

    fn released(&self, permit: Permit) {
        let end = Instant::now();
        if let Some(start) = self.open.lock().unwrap().remove(&permit) {
            self.closed.lock().unwrap().push((start, end));
        }
    }
}

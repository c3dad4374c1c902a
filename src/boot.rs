//! Boot: building the initial model from a list of operations.
//!
//! All boot operations run in a single context, so the model is published
//! only if every one of them succeeds. Authorization and persistence are
//! skipped. With `parallel_boot` enabled, RUNTIME work addressed to a
//! subsystem is collected per subsystem and run on a rayon pool once the
//! whole MODEL stage is done.

use crate::access::CallerContext;
use crate::context::{ContextKind, ContextOptions, OperationContext, OperationStepHandler, PrepareStepHandler};
use crate::controller::ModelController;
use crate::error::{ErrorCategory, Result};
use crate::operation::{Operation, OperationHeaders, OperationResponse};
use anyhow::Context;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use txkit::Permit;

/// Runs the RUNTIME batches set aside during boot, one child context per
/// subsystem.
pub(crate) struct ParallelRuntimeHandler;

impl OperationStepHandler for ParallelRuntimeHandler {
    fn execute(&self, ctx: &mut OperationContext, _operation: &Operation) -> Result<()> {
        let batches = ctx.take_parallel_batches();
        if batches.is_empty() {
            ctx.step_completed();
            return Ok(());
        }

        let work: Vec<_> = batches
            .into_iter()
            .map(|(subsystem, steps)| (subsystem, ctx.runtime_child_seed(), steps))
            .collect();
        let threads = ctx.config().boot_threads;
        debug!("Running runtime boot work for {} subsystems", work.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("modelctl-boot-{index}"))
            .build()
            .context("Failed to create boot thread pool");
        let outcomes: Vec<_> = match pool {
            Ok(pool) => pool.install(|| {
                work.into_par_iter()
                    .map(|(subsystem, seed, steps)| {
                        debug!("Booting runtime services of subsystem {subsystem}");
                        OperationContext::run_runtime_batch(seed, steps)
                    })
                    .collect()
            }),
            Err(err) => {
                warn!("{err:#}; running runtime boot work sequentially");
                work.into_iter()
                    .map(|(_, seed, steps)| OperationContext::run_runtime_batch(seed, steps))
                    .collect()
            }
        };

        for outcome in outcomes {
            ctx.merge_child_outcome(outcome);
        }
        ctx.step_completed();
        Ok(())
    }
}

impl ModelController {
    /// Run the boot operations as one unit.
    ///
    /// The result holds one response per operation under `step-N`.
    pub fn boot(&self, operations: Vec<Operation>) -> OperationResponse {
        let started = Instant::now();
        let count = operations.len();
        info!("Booting with {count} operations");

        let mut ctx = OperationContext::new(
            Arc::clone(&self.shared),
            ContextOptions {
                kind: ContextKind::Boot,
                caller: CallerContext::default(),
                headers: OperationHeaders::default(),
                control: None,
                cancel: Arc::new(AtomicBool::new(false)),
                permit: Permit::next(),
            },
        );

        let mut slots = Vec::with_capacity(count);
        for operation in operations {
            match ctx.add_initial_step(operation, Arc::new(PrepareStepHandler)) {
                Ok(slot) => slots.push(slot),
                Err(err) => return OperationResponse::failed(err.to_string(), err.category()),
            }
        }
        let action = ctx.run();

        let mut results = Map::new();
        let mut failures = Map::new();
        for (index, slot) in slots.iter().enumerate() {
            let Some(response) = ctx.response(*slot) else {
                continue;
            };
            let key = format!("step-{}", index + 1);
            if let Some(description) = &response.failure_description {
                failures.insert(key.clone(), Value::String(description.clone()));
            }
            results.insert(key, response.to_value());
        }

        if action.is_rollback() {
            let kind = slots
                .iter()
                .filter_map(|slot| ctx.response(*slot)?.failure_kind)
                .next()
                .unwrap_or(ErrorCategory::Server);
            let mut response = OperationResponse::failed(
                format!("Boot failed and was rolled back. Operations that failed: {}", Value::Object(failures)),
                kind,
            );
            response.rolled_back = true;
            response.result = Value::Object(results);
            error!("{}", response.failure_description.as_deref().unwrap_or_default());
            return response;
        }

        info!("Boot completed in {:.2?}", started.elapsed());
        OperationResponse::success(Value::Object(results))
    }

    /// Boot from the operations the configured persister loads.
    pub fn boot_from_persister(&self) -> anyhow::Result<OperationResponse> {
        let operations = self
            .shared
            .persister
            .load()
            .context("Failed to load persisted configuration")?;
        Ok(self.boot(operations))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::context::OperationContext;
    use crate::controller::ModelController;
    use crate::error::{ControllerError, Result};
    use crate::handlers::RuntimeHandler;
    use crate::operation::{Operation, names};
    use crate::persister::JsonFilePersister;
    use crate::services::{ServiceDescriptor, ServiceName};
    use crate::testing::{addr, controller_with, register_subsystem};
    use serde_json::{Map, Value};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Installs one service per subsystem and records the thread it ran on.
    #[derive(Default)]
    struct ServiceInstaller {
        threads: Mutex<Vec<String>>,
    }

    impl RuntimeHandler for ServiceInstaller {
        fn perform(&self, ctx: &mut OperationContext, operation: &Operation, model: &Map<String, Value>) -> Result<()> {
            if model.get("value") == Some(&Value::from(-1)) {
                return Err(ControllerError::failed("refusing to start"));
            }
            let name = thread::current().name().unwrap_or_default().to_string();
            self.threads.lock().unwrap().push(name);
            let subsystem = operation.address.get(0).map(|e| e.value().to_string()).unwrap_or_default();
            ctx.install_service(ServiceName::new(subsystem), ServiceDescriptor::new())
        }
    }

    fn booting_controller(parallel: bool) -> (ModelController, Arc<ServiceInstaller>) {
        let config = ControllerConfig {
            parallel_boot: parallel,
            boot_threads: 2,
            ..ControllerConfig::default()
        };
        let controller = controller_with(ModelController::builder().config(config));
        let installer = Arc::new(ServiceInstaller::default());
        register_subsystem(&controller, Some(Arc::clone(&installer) as Arc<dyn RuntimeHandler>));
        (controller, installer)
    }

    fn adds(values: &[(&str, i64)]) -> Vec<Operation> {
        values
            .iter()
            .map(|(name, value)| Operation::new(names::ADD, addr(&format!("/subsystem={name}"))).param("value", *value))
            .collect()
    }

    #[test]
    fn test_sequential_boot() {
        let (controller, installer) = booting_controller(false);
        let response = controller.boot(adds(&[("a", 1), ("b", 2)]));
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.result["step-2"]["outcome"], "success");
        assert_eq!(controller.root().child_names("subsystem"), vec!["a", "b"]);
        assert_eq!(installer.threads.lock().unwrap().len(), 2);
        assert!(controller.services().state(&ServiceName::new("b")).is_some());
    }

    #[test]
    fn test_parallel_boot_runs_on_pool() {
        let (controller, installer) = booting_controller(true);
        let response = controller.boot(adds(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]));
        assert!(response.is_success(), "{response:?}");
        assert_eq!(controller.root().child_names("subsystem").len(), 4);

        let threads = installer.threads.lock().unwrap();
        assert_eq!(threads.len(), 4);
        assert!(threads.iter().all(|name| name.starts_with("modelctl-boot-")), "{threads:?}");
        for name in ["a", "b", "c", "d"] {
            assert!(controller.services().state(&ServiceName::new(name)).is_some());
        }
    }

    #[test]
    fn test_parallel_boot_failure_rolls_back_everything() {
        let (controller, _) = booting_controller(true);
        let response = controller.boot(adds(&[("a", 1), ("bad", -1), ("c", 3)]));
        assert!(!response.is_success());
        assert!(response.rolled_back);
        let description = response.failure_description.unwrap();
        assert!(description.contains("step-2"), "{description}");
        assert!(description.contains("refusing to start"));
        assert!(controller.root().child_names("subsystem").is_empty());
        assert!(controller.services().names().is_empty());
    }

    #[test]
    fn test_boot_model_failure() {
        let (controller, installer) = booting_controller(false);
        let mut operations = adds(&[("a", 1)]);
        operations.push(Operation::new(names::ADD, addr("/subsystem=b")));
        let response = controller.boot(operations);
        assert!(response.rolled_back);
        assert!(installer.threads.lock().unwrap().is_empty());
        assert!(controller.root().child_names("subsystem").is_empty());
    }

    #[test]
    fn test_boot_from_persister_replays_stored_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let writer = controller_with(ModelController::builder().persister(Arc::new(JsonFilePersister::new(&path))));
        register_subsystem(&writer, None);
        for (name, value) in [("a", 1), ("b", 2)] {
            let op = Operation::new(names::ADD, addr(&format!("/subsystem={name}"))).param("value", value);
            assert!(writer.execute(op).is_success());
        }

        let reader = controller_with(ModelController::builder().persister(Arc::new(JsonFilePersister::new(&path))));
        register_subsystem(&reader, None);
        let response = reader.boot_from_persister().unwrap();
        assert!(response.is_success(), "{response:?}");
        let b = reader.root();
        assert_eq!(b.navigate(&addr("/subsystem=b")).unwrap().attribute("value"), Some(&Value::from(2)));
    }
}

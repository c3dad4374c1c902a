//! # Operation Context
//!
//! Executes one management operation as a sequence of steps across the
//! MODEL, RUNTIME and VERIFY stages, then commits or rolls back as a unit.
//!
//! ## Core Concepts
//!
//! - **Steps**: a handler plus the operation it works on and the response
//!   slot it writes to. Handlers add further steps to later stages, or with
//!   [`Stage::Immediate`] ahead of everything queued in the current one.
//! - **Completion**: a handler either calls [`OperationContext::complete_step`],
//!   which runs every remaining step and returns the final [`ResultAction`]
//!   to the handler, or [`OperationContext::complete_step_with`], which
//!   registers rollback logic and returns at once.
//! - **Working model**: the first model write takes the controller lock and
//!   copies the published tree. The copy is published only when the context
//!   commits, and the lock is held until then.
//! - **Failures**: a failure in MODEL always rolls back. A RUNTIME or VERIFY
//!   failure rolls back unless the operation set the
//!   `rollback-on-runtime-failure` header to false.
//!
//! ## Example
//!
//! ```ignore
//! let handler = handler_fn(|ctx, op| {
//!     let value = op.require("value")?.clone();
//!     ctx.read_resource_for_update(&PathAddress::EMPTY)?
//!         .model_mut()
//!         .insert("value".to_string(), value);
//!     ctx.add_step(runtime_handler, Stage::Runtime)?;
//!     ctx.step_completed();
//!     Ok(())
//! });
//! ```

mod attachment;
mod prepare;
mod stage;
mod step;

pub use attachment::AttachmentKey;
pub use stage::{ResultAction, Stage};
pub use step::{OperationStepHandler, ResponseId, RollbackHandler, handler_fn};

pub(crate) use prepare::PrepareStepHandler;
pub(crate) use step::Step;

use crate::access::{AuthorizationResult, CallerContext};
use crate::attribute::ResourceDefinition;
use crate::config::{ControllerConfig, RunningMode};
use crate::controller::{ControllerShared, PreparedVote, TransactionControl};
use crate::error::{ControllerError, ErrorCategory, Result};
use crate::expression::ExpressionResolver;
use crate::operation::{Operation, OperationHeaders, OperationResponse, Outcome, names};
use crate::process_state::{ProcessState, Stamp};
use crate::registry::{OperationEntry, OperationRegistry};
use crate::resource::Resource;
use crate::services::{ServiceDescriptor, ServiceName, ServiceState};
use attachment::Attachments;
use log::{debug, error, info, trace, warn};
use pathaddr::PathAddress;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use step::{Completion, StepRecord};
use txkit::{ControllerResource, ControllerTransaction, LockError, Permit};

const SUBSYSTEM: &str = "subsystem";

/// Severity of a message reported through [`OperationContext::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextKind {
    Operation,
    Boot,
    /// Runs a batch of boot RUNTIME steps for a parent boot context
    RuntimeChild,
}

pub(crate) struct ContextOptions {
    pub(crate) kind: ContextKind,
    pub(crate) caller: CallerContext,
    pub(crate) headers: OperationHeaders,
    pub(crate) control: Option<Arc<dyn TransactionControl>>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) permit: Permit,
}

struct BlockingTimeout {
    base: Duration,
    short: Duration,
    timed_out: bool,
}

impl BlockingTimeout {
    /// After one timeout the rest of the operation uses the short bound.
    fn current(&self) -> Duration {
        if self.timed_out {
            self.short.min(self.base)
        } else {
            self.base
        }
    }
}

/// RUNTIME steps set aside for concurrent execution during boot.
#[derive(Default)]
struct ParallelRuntime {
    batches: BTreeMap<String, Vec<Step>>,
    coordinator_added: bool,
}

/// Everything a worker thread needs to build a runtime child context.
pub(crate) struct RuntimeChildSeed {
    shared: Arc<ControllerShared>,
    options: ContextOptions,
    snapshot: Arc<Resource>,
}

/// What a runtime child context hands back to its parent.
#[derive(Default)]
pub(crate) struct ChildOutcome {
    failures: Vec<(ResponseId, String, ErrorCategory)>,
    installed: Vec<ServiceName>,
    removed: Vec<(ServiceName, ServiceDescriptor)>,
    cancelled: bool,
}

/// Publishes the working model when the transaction commits.
struct ModelCommit {
    shared: Arc<ControllerShared>,
    model: Option<Resource>,
}

impl ControllerResource for ModelCommit {
    fn commit(&mut self) -> anyhow::Result<()> {
        if let Some(model) = self.model.take() {
            self.shared.root.store(Arc::new(model));
        }
        Ok(())
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        self.model = None;
        Ok(())
    }
}

/// Fails the operation when services installed by it did not come up.
struct ServiceVerificationHandler;

impl OperationStepHandler for ServiceVerificationHandler {
    fn execute(&self, ctx: &mut OperationContext, _operation: &Operation) -> Result<()> {
        let failed = ctx.failed_services();
        if !failed.is_empty() {
            let target = ctx.failure_target();
            ctx.record_failure(
                target,
                format!("Services failed to start: {}", failed.join(", ")),
                ErrorCategory::Server,
            );
        }
        ctx.step_completed();
        Ok(())
    }
}

/// Execution state of one operation.
pub struct OperationContext {
    shared: Arc<ControllerShared>,
    config: Arc<ControllerConfig>,
    kind: ContextKind,
    permit: Permit,
    caller: CallerContext,
    headers: OperationHeaders,
    control: Option<Arc<dyn TransactionControl>>,
    cancel: Arc<AtomicBool>,
    blocking: BlockingTimeout,

    stage: Stage,
    queues: [VecDeque<Step>; 3],
    records: Vec<StepRecord>,
    active: Option<usize>,
    responses: Vec<OperationResponse>,
    result_action: ResultAction,
    rollback_only: bool,
    cancelled: bool,
    concluded: bool,
    first_failure: Option<(String, ErrorCategory)>,

    snapshot: Arc<Resource>,
    working: Option<Resource>,
    affected: BTreeSet<PathAddress>,
    lock_held: bool,
    transaction: Option<ControllerTransaction>,

    runtime_affected: bool,
    verification_added: bool,
    installed_services: Vec<ServiceName>,
    removed_services: Vec<(ServiceName, ServiceDescriptor)>,
    restarted: HashMap<PathAddress, String>,
    reload_stamp: Option<Stamp>,
    restart_stamp: Option<Stamp>,

    attachments: Attachments,
    parallel: Option<ParallelRuntime>,
}

impl OperationContext {
    pub(crate) fn new(shared: Arc<ControllerShared>, options: ContextOptions) -> Self {
        let config = shared.config.load_full();
        let snapshot = shared.root.load_full();
        let blocking = BlockingTimeout {
            base: options
                .headers
                .blocking_timeout
                .unwrap_or_else(|| config.blocking_timeout()),
            short: config.short_blocking_timeout(),
            timed_out: false,
        };
        let child = options.kind == ContextKind::RuntimeChild;
        let parallel = (options.kind == ContextKind::Boot && config.parallel_boot)
            .then(ParallelRuntime::default);

        Self {
            shared,
            config,
            kind: options.kind,
            permit: options.permit,
            caller: options.caller,
            headers: options.headers,
            control: options.control,
            cancel: options.cancel,
            blocking,
            stage: if child { Stage::Runtime } else { Stage::Model },
            queues: Default::default(),
            records: Vec::new(),
            active: None,
            responses: Vec::new(),
            result_action: ResultAction::Keep,
            rollback_only: false,
            cancelled: false,
            concluded: false,
            first_failure: None,
            snapshot,
            working: None,
            affected: BTreeSet::new(),
            lock_held: false,
            transaction: (!child).then(ControllerTransaction::new),
            runtime_affected: false,
            verification_added: false,
            installed_services: Vec::new(),
            removed_services: Vec::new(),
            restarted: HashMap::new(),
            reload_stamp: None,
            restart_stamp: None,
            attachments: Attachments::default(),
            parallel,
        }
    }

    // ========================================================================
    // Context information
    // ========================================================================

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_booting(&self) -> bool {
        self.kind != ContextKind::Operation
    }

    pub fn running_mode(&self) -> RunningMode {
        self.config.running_mode
    }

    /// Identity of the caller that submitted the operation.
    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    pub fn permit(&self) -> Permit {
        self.permit
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.shared.registry
    }

    pub fn resolver(&self) -> &dyn ExpressionResolver {
        self.shared.resolver.as_ref()
    }

    /// Resolve expressions in `value` with the controller's resolver.
    pub fn resolve_expressions(&self, value: &Value) -> Result<Value> {
        self.shared.resolver.resolve(value)
    }

    /// Address of the step being executed.
    pub fn current_address(&self) -> PathAddress {
        self.active_record()
            .map(|record| record.step.address.clone())
            .unwrap_or_default()
    }

    /// Attribute definitions registered for the current address.
    pub fn resource_definition(&self) -> Option<Arc<ResourceDefinition>> {
        self.shared
            .registry
            .resource_definition(&self.current_address())
    }

    pub fn is_rolling_back(&self) -> bool {
        self.result_action.is_rollback()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled || self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Force the operation to roll back once all steps have run.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_resource_service_restart_allowed(&self) -> bool {
        self.headers.allow_resource_service_restart
    }

    fn active_record(&self) -> Option<&StepRecord> {
        self.active.and_then(|index| self.records.get(index))
    }

    fn failure_target(&self) -> ResponseId {
        self.active_record()
            .map_or(ResponseId(0), |record| record.step.response)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Add a step for the current operation, writing to the current response.
    pub fn add_step(&mut self, handler: Arc<dyn OperationStepHandler>, stage: Stage) -> Result<()> {
        let Some(record) = self.active_record() else {
            return Err(ControllerError::InvalidOperation(
                "no step is executing".to_string(),
            ));
        };
        let step = Step {
            handler,
            operation: Arc::clone(&record.step.operation),
            address: record.step.address.clone(),
            response: record.step.response,
        };
        self.enqueue(step, stage)
    }

    /// Add a step for another operation, writing to the current response.
    pub fn add_step_for(
        &mut self,
        operation: Operation,
        handler: Arc<dyn OperationStepHandler>,
        stage: Stage,
    ) -> Result<()> {
        let response = self.failure_target();
        self.add_step_with_response(response, operation, handler, stage)
    }

    /// Add a step writing to a response slot from [`Self::new_response`].
    pub fn add_step_with_response(
        &mut self,
        response: ResponseId,
        operation: Operation,
        handler: Arc<dyn OperationStepHandler>,
        stage: Stage,
    ) -> Result<()> {
        self.enqueue(Step::new(handler, Arc::new(operation), response), stage)
    }

    /// Allocate an empty response slot.
    pub fn new_response(&mut self) -> ResponseId {
        self.responses.push(OperationResponse::default());
        ResponseId(self.responses.len() - 1)
    }

    pub fn response(&self, id: ResponseId) -> Option<&OperationResponse> {
        self.responses.get(id.0)
    }

    fn enqueue(&mut self, step: Step, stage: Stage) -> Result<()> {
        let (target, front) = if stage == Stage::Immediate {
            (self.stage, true)
        } else {
            (stage, false)
        };
        let invalid = || ControllerError::InvalidStage {
            requested: stage.to_string(),
            current: self.stage.to_string(),
        };
        if self.concluded || target < self.stage {
            return Err(invalid());
        }
        let index = target.queue_index().ok_or_else(invalid)?;

        if target > Stage::Model && !self.config.running_mode.has_runtime() {
            debug!(
                "Skipping {target} step for '{}' at {}: runtime is not available",
                step.operation.name, step.address
            );
            if let Some(response) = self.responses.get_mut(step.response.0) {
                response
                    .response_headers
                    .insert(names::RUNTIME_UPDATE_SKIPPED.to_string(), Value::Bool(true));
            }
            return Ok(());
        }

        if target == Stage::Runtime && !front && self.parallel.is_some() {
            let subsystem = step
                .address
                .get(0)
                .filter(|element| element.key() == SUBSYSTEM)
                .map(|element| element.value().to_string());
            if let Some(subsystem) = subsystem {
                self.divert_to_parallel(subsystem, step);
                return Ok(());
            }
        }

        let queue = &mut self.queues[index];
        if front {
            queue.push_front(step);
        } else {
            queue.push_back(step);
        }
        Ok(())
    }

    fn divert_to_parallel(&mut self, subsystem: String, step: Step) {
        let add_coordinator = match self.parallel.as_mut() {
            Some(parallel) => {
                parallel.batches.entry(subsystem).or_default().push(step);
                !mem::replace(&mut parallel.coordinator_added, true)
            }
            None => false,
        };
        if add_coordinator {
            let response = self.new_response();
            let operation = Arc::new(Operation::new("parallel-boot", PathAddress::EMPTY));
            let coordinator = Step::new(Arc::new(crate::boot::ParallelRuntimeHandler), operation, response);
            self.queues[1].push_back(coordinator);
        }
    }

    /// Complete the current step and run everything after it.
    ///
    /// Returns once the operation has committed or rolled back, so the
    /// caller can react to the outcome.
    pub fn complete_step(&mut self) -> ResultAction {
        let Some(index) = self.active else {
            return self.result_action;
        };
        let Some(record) = self.records.get_mut(index).filter(|record| record.is_pending()) else {
            warn!("Step at {} completed more than once", self.current_address());
            return self.result_action;
        };
        record.completion = Completion::Recursive;
        self.run_steps();
        self.active = Some(index);
        self.result_action
    }

    /// Complete the current step; `rollback` runs if the operation rolls back.
    pub fn complete_step_with<F>(&mut self, rollback: F)
    where
        F: FnOnce(&mut OperationContext, &Operation) + Send + 'static,
    {
        self.defer_completion(Some(Box::new(rollback)));
    }

    /// Complete the current step with nothing to undo on rollback.
    pub fn step_completed(&mut self) {
        self.defer_completion(None);
    }

    fn defer_completion(&mut self, rollback: Option<RollbackHandler>) {
        let address = self.current_address();
        match self.active.and_then(|index| self.records.get_mut(index)) {
            Some(record) if record.is_pending() => record.completion = Completion::Deferred(rollback),
            _ => warn!("Step at {address} completed more than once"),
        }
    }

    // ========================================================================
    // Responses
    // ========================================================================

    fn response_slot(&mut self) -> &mut OperationResponse {
        let id = self.failure_target();
        if id.0 >= self.responses.len() {
            self.responses.resize_with(id.0 + 1, OperationResponse::default);
        }
        &mut self.responses[id.0]
    }

    /// Result value of the current response.
    pub fn result_mut(&mut self) -> &mut Value {
        &mut self.response_slot().result
    }

    pub fn set_result(&mut self, value: Value) {
        self.response_slot().result = value;
    }

    /// Mark the current response failed without raising an error.
    pub fn set_failure(&mut self, description: impl Into<String>) {
        let target = self.failure_target();
        self.record_failure(target, description.into(), ErrorCategory::Client);
    }

    /// Whether the current response has a failure recorded.
    pub fn has_failure(&self) -> bool {
        self.responses
            .get(self.failure_target().0)
            .is_some_and(OperationResponse::has_failure)
    }

    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.response_slot()
            .response_headers
            .insert(name.into(), value.into());
    }

    /// Operation that would undo the current one.
    pub fn set_compensating_operation(&mut self, operation: Operation) {
        self.response_slot().compensating_operation = Some(operation);
    }

    /// Log a message for the operator; warnings are also returned to the caller.
    pub fn report(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!("{message}"),
            Severity::Warning => warn!("{message}"),
            Severity::Error => error!("{message}"),
        }
        if severity != Severity::Info {
            let headers = &mut self.response_slot().response_headers;
            match headers.get_mut("warnings") {
                Some(Value::Array(list)) => list.push(Value::String(message)),
                _ => {
                    headers.insert("warnings".to_string(), Value::Array(vec![Value::String(message)]));
                }
            }
        }
    }

    fn record_failure(&mut self, response: ResponseId, description: String, kind: ErrorCategory) {
        if let Some(slot) = self.responses.get_mut(response.0)
            && slot.failure_description.is_none()
        {
            slot.failure_description = Some(description.clone());
            slot.failure_kind = Some(kind);
        }
        if self.first_failure.is_none() {
            self.first_failure = Some((description, kind));
        }
        if !self.concluded && (self.stage <= Stage::Model || self.headers.rollback_on_runtime_failure) {
            self.result_action = ResultAction::Rollback;
        }
    }

    // ========================================================================
    // Model
    // ========================================================================

    fn view(&self) -> &Resource {
        self.working.as_ref().unwrap_or(self.snapshot.as_ref())
    }

    /// The model as this operation currently sees it.
    pub fn root(&self) -> &Resource {
        self.view()
    }

    /// The published model this operation started from.
    pub fn original_root(&self) -> &Resource {
        &self.snapshot
    }

    /// Read the resource at an address relative to the current step.
    pub fn read_resource(&self, relative: &PathAddress) -> Result<&Resource> {
        let address = self.current_address().append(relative);
        self.view().navigate(&address)
    }

    pub fn read_resource_from_root(&self, address: &PathAddress) -> Result<&Resource> {
        self.view().navigate(address)
    }

    /// Whether this operation has changed the model.
    pub fn is_model_affected(&self) -> bool {
        !self.affected.is_empty()
    }

    fn check_writable(&self, address: &PathAddress) -> Result<()> {
        if self.stage != Stage::Model {
            return Err(ControllerError::StageViolation {
                action: "Modifying the model",
                stage: self.stage.to_string(),
            });
        }
        if address.is_multi_target() {
            return Err(ControllerError::WriteNotPermitted {
                address: address.clone(),
                reason: "wildcard addresses cannot be modified",
            });
        }
        Ok(())
    }

    fn acquire_model_lock(&mut self) -> Result<()> {
        if self.lock_held {
            return Ok(());
        }
        let timeout = self.blocking.current();
        if let Err(err) = self.shared.lock.lock_timeout(self.permit, timeout, &self.cancel) {
            match err {
                LockError::Timeout { .. } => self.blocking.timed_out = true,
                LockError::Cancelled => self.cancelled = true,
                LockError::NotHolder { .. } => {}
            }
            return Err(err.into());
        }
        trace!("Permit {} acquired the model lock", self.permit);
        self.lock_held = true;
        Ok(())
    }

    fn release_lock(&mut self) {
        if !self.lock_held {
            return;
        }
        self.lock_held = false;
        if let Err(err) = self.shared.lock.unlock(self.permit) {
            error!("Failed to release the model lock: {err}");
        }
    }

    /// The private working copy, taken from the published model under the lock.
    fn working_model(&mut self) -> Result<&mut Resource> {
        self.acquire_model_lock()?;
        let shared = &self.shared;
        let snapshot = &mut self.snapshot;
        Ok(self.working.get_or_insert_with(|| {
            let current = shared.root.load_full();
            let model = (*current).clone();
            *snapshot = current;
            model
        }))
    }

    /// Get the resource at an address relative to the current step for modification.
    pub fn read_resource_for_update(&mut self, relative: &PathAddress) -> Result<&mut Resource> {
        let address = self.current_address().append(relative);
        self.check_writable(&address)?;
        self.working_model()?.navigate(&address)?;
        self.affected.insert(address.clone());
        self.working_model()?.navigate_mut(&address)
    }

    /// Add a resource at an address relative to the current step.
    pub fn add_resource(&mut self, relative: &PathAddress, resource: Resource) -> Result<()> {
        let address = self.current_address().append(relative);
        self.check_writable(&address)?;
        let Some(element) = address.last_element().cloned() else {
            return Err(ControllerError::DuplicateResource { address });
        };
        if !self.shared.registry.is_registered(&address) {
            return Err(ControllerError::NoSuchResourceType { address });
        }

        let parent = self.working_model()?.navigate_mut(&address.parent())?;
        if parent.has_child(&element) {
            return Err(ControllerError::DuplicateResource { address });
        }
        parent.register_child(&element, resource);
        self.affected.insert(address);
        Ok(())
    }

    /// Remove the resource at an address relative to the current step.
    pub fn remove_resource(&mut self, relative: &PathAddress) -> Result<Resource> {
        let address = self.current_address().append(relative);
        self.check_writable(&address)?;
        let removed = self.working_model()?.remove(&address)?;
        self.affected.insert(address);
        Ok(removed)
    }

    /// Resolve and authorize the handler registered for `operation`.
    pub fn resolve_step_handler(&self, operation: &Operation) -> Result<OperationEntry> {
        let registry = &self.shared.registry;
        let address = &operation.address;
        let Some(entry) = registry.get_operation_entry(address, &operation.name) else {
            if !registry.is_registered(address) {
                return Err(ControllerError::NoSuchResourceType {
                    address: address.clone(),
                });
            }
            return Err(ControllerError::NoHandler {
                operation: operation.name.clone(),
                address: address.clone(),
            });
        };

        if !self.is_booting()
            && let AuthorizationResult::Deny(reason) =
                self.shared
                    .authorizer
                    .authorize(&self.caller, operation, &entry.flags().effects())
        {
            return Err(ControllerError::Unauthorized {
                operation: operation.name.clone(),
                address: address.clone(),
                reason,
            });
        }
        Ok(entry)
    }

    // ========================================================================
    // Runtime services
    // ========================================================================

    fn check_runtime_access(&self, action: &'static str) -> Result<()> {
        if self.is_rolling_back() || matches!(self.stage, Stage::Runtime | Stage::Verify) {
            return Ok(());
        }
        Err(ControllerError::StageViolation {
            action,
            stage: self.stage.to_string(),
        })
    }

    /// Install a service; it is removed again if the operation rolls back.
    pub fn install_service(&mut self, name: ServiceName, descriptor: ServiceDescriptor) -> Result<()> {
        self.check_runtime_access("Installing a service")?;
        self.shared.services.install(name.clone(), descriptor)?;
        self.runtime_affected = true;
        if !self.is_rolling_back() {
            self.installed_services.push(name);
            self.ensure_verification();
        }
        Ok(())
    }

    /// Remove a service; it is reinstalled if the operation rolls back.
    pub fn remove_service(&mut self, name: &ServiceName) -> Result<Option<ServiceDescriptor>> {
        self.check_runtime_access("Removing a service")?;
        let removed = self.shared.services.remove(name);
        if let Some(descriptor) = &removed
            && !self.is_rolling_back()
        {
            self.runtime_affected = true;
            match self.installed_services.iter().position(|n| n == name) {
                Some(position) => {
                    self.installed_services.remove(position);
                }
                None => self.removed_services.push((name.clone(), descriptor.clone())),
            }
        }
        Ok(removed)
    }

    pub fn service_state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.shared.services.state(name)
    }

    fn ensure_verification(&mut self) {
        if self.verification_added {
            return;
        }
        self.verification_added = true;
        let response = self.failure_target();
        let operation = self.active_record().map_or_else(
            || Arc::new(Operation::new("verify-services", PathAddress::EMPTY)),
            |record| Arc::clone(&record.step.operation),
        );
        let step = Step::new(Arc::new(ServiceVerificationHandler), operation, response);
        if let Err(err) = self.enqueue(step, Stage::Verify) {
            warn!("Cannot verify installed services: {err}");
        }
    }

    fn failed_services(&self) -> Vec<String> {
        self.installed_services
            .iter()
            .filter_map(|name| match self.shared.services.state(name) {
                Some(ServiceState::Failed(reason)) => Some(format!("{name} ({reason})")),
                _ => None,
            })
            .collect()
    }

    fn await_services(&mut self) {
        if let Err(err) = self.await_services_settled() {
            let kind = err.category();
            if kind == ErrorCategory::Cancelled {
                self.cancelled = true;
            }
            warn!("{err}");
            let target = self.failure_target();
            self.record_failure(target, err.to_string(), kind);
        }
    }

    fn await_services_settled(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.blocking.current();
        let poll = self.config.verify_poll_interval();
        loop {
            let pending: Vec<String> = self
                .installed_services
                .iter()
                .filter(|name| self.shared.services.state(name) == Some(ServiceState::Starting))
                .map(ToString::to_string)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if self.cancel.load(Ordering::SeqCst) {
                return Err(ControllerError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                self.blocking.timed_out = true;
                return Err(ControllerError::ServiceTimeout {
                    pending: pending.join(", "),
                });
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Record that the current operation restarted the services of `address`.
    ///
    /// Returns false when another owner already claimed the restart.
    pub fn mark_resource_restarted(&mut self, address: PathAddress, owner: &str) -> bool {
        match self.restarted.get(&address) {
            Some(existing) => existing == owner,
            None => {
                self.restarted.insert(address, owner.to_string());
                true
            }
        }
    }

    pub fn revert_resource_restarted(&mut self, address: &PathAddress, owner: &str) -> bool {
        if self.restarted.get(address).is_some_and(|existing| existing == owner) {
            self.restarted.remove(address);
            return true;
        }
        false
    }

    // ========================================================================
    // Process state
    // ========================================================================

    /// Flag the process as needing a reload for changes to take effect.
    pub fn reload_required(&mut self) {
        if self.reload_stamp.is_none() {
            self.reload_stamp = Some(self.shared.process_state.set_reload_required());
        }
        self.set_response_header(names::OPERATION_REQUIRES_RELOAD, true);
    }

    pub fn revert_reload_required(&mut self) {
        if let Some(stamp) = self.reload_stamp.take() {
            self.shared.process_state.revert_reload_required(stamp);
        }
        self.response_slot()
            .response_headers
            .remove(names::OPERATION_REQUIRES_RELOAD);
    }

    /// Flag the process as needing a restart for changes to take effect.
    pub fn restart_required(&mut self) {
        if self.restart_stamp.is_none() {
            self.restart_stamp = Some(self.shared.process_state.set_restart_required());
        }
        self.set_response_header(names::OPERATION_REQUIRES_RESTART, true);
    }

    pub fn revert_restart_required(&mut self) {
        if let Some(stamp) = self.restart_stamp.take() {
            self.shared.process_state.revert_restart_required(stamp);
        }
        self.response_slot()
            .response_headers
            .remove(names::OPERATION_REQUIRES_RESTART);
    }

    // ========================================================================
    // Transaction
    // ========================================================================

    /// Enlist a resource in the operation's transaction.
    pub fn register_transaction_resource(&mut self, resource: Box<dyn ControllerResource>) -> Result<()> {
        match self.transaction.as_mut() {
            Some(transaction) if !self.concluded => {
                transaction.register_resource(resource);
                Ok(())
            }
            _ => Err(ControllerError::StageViolation {
                action: "Enlisting a transaction resource",
                stage: self.stage.to_string(),
            }),
        }
    }

    // ========================================================================
    // Attachments
    // ========================================================================

    pub fn attach<T: Any + Send>(&mut self, key: &AttachmentKey<T>, value: T) -> Option<T> {
        self.attachments.attach(key, value)
    }

    pub fn attach_if_absent<T: Any + Send>(&mut self, key: &AttachmentKey<T>, value: T) -> Option<&mut T> {
        self.attachments.attach_if_absent(key, value)
    }

    pub fn get_attachment<T: Any + Send>(&self, key: &AttachmentKey<T>) -> Option<&T> {
        self.attachments.get(key)
    }

    pub fn get_attachment_mut<T: Any + Send>(&mut self, key: &AttachmentKey<T>) -> Option<&mut T> {
        self.attachments.get_mut(key)
    }

    pub fn detach<T: Any + Send>(&mut self, key: &AttachmentKey<T>) -> Option<T> {
        self.attachments.detach(key)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Queue the first step of an operation and give it a fresh response.
    pub(crate) fn add_initial_step(
        &mut self,
        operation: Operation,
        handler: Arc<dyn OperationStepHandler>,
    ) -> Result<ResponseId> {
        let response = self.new_response();
        self.add_step_with_response(response, operation, handler, Stage::Model)?;
        Ok(response)
    }

    /// Run all queued steps, commit or roll back, and release the lock.
    pub(crate) fn run(&mut self) -> ResultAction {
        self.run_steps();
        if self.result_action.is_rollback() && self.kind != ContextKind::RuntimeChild {
            self.undo_runtime_changes();
            self.revert_process_state();
        }
        self.release_lock();
        self.result_action
    }

    /// Take a response out of the context, filling in failure details.
    pub(crate) fn take_response(&mut self, id: ResponseId) -> OperationResponse {
        let mut response = self
            .responses
            .get_mut(id.0)
            .map(mem::take)
            .unwrap_or_default();

        if self.result_action.is_rollback() || self.cancelled {
            response.outcome = self.rollback_outcome();
            response.rolled_back = true;
        }
        if response.outcome != Outcome::Success && response.failure_description.is_none() {
            let (description, kind) = self.first_failure.clone().unwrap_or_else(|| {
                if self.cancelled {
                    ("Operation cancelled".to_string(), ErrorCategory::Cancelled)
                } else {
                    ("Operation was rolled back".to_string(), ErrorCategory::Server)
                }
            });
            response.failure_description = Some(description);
            response.failure_kind = Some(kind);
        }
        if response.outcome == Outcome::Cancelled {
            response.failure_kind = Some(ErrorCategory::Cancelled);
        }
        if !response.is_success() {
            response.compensating_operation = None;
        }

        let state = self.shared.process_state.state();
        if state != ProcessState::Running {
            response
                .response_headers
                .insert(names::PROCESS_STATE.to_string(), Value::String(state.to_string()));
        }
        response
    }

    fn can_continue(&mut self) -> bool {
        if !self.cancelled && self.cancel.load(Ordering::SeqCst) {
            debug!("Operation cancelled by the caller");
            self.cancelled = true;
        }
        if self.cancelled {
            self.result_action = ResultAction::Rollback;
        }
        !self.result_action.is_rollback()
    }

    fn run_steps(&mut self) {
        loop {
            if self.concluded {
                break;
            }
            if !self.can_continue() || self.stage == Stage::Done {
                self.conclude();
                break;
            }
            let next = self
                .stage
                .queue_index()
                .and_then(|index| self.queues[index].pop_front());
            match next {
                Some(step) => {
                    if self.execute_step(step) {
                        return;
                    }
                }
                None => self.advance_stage(),
            }
        }
        self.finalize_deferred();
    }

    fn advance_stage(&mut self) {
        let next = self.stage.next();
        trace!("Entering stage {next}");
        self.stage = next;
        if next == Stage::Verify && self.runtime_affected {
            self.await_services();
        }
    }

    /// Execute one step. Returns true when the step completed recursively,
    /// which means every later step has already run.
    fn execute_step(&mut self, step: Step) -> bool {
        let handler = Arc::clone(&step.handler);
        let operation = Arc::clone(&step.operation);
        let response = step.response;
        trace!(
            "Executing '{}' at {} in stage {}",
            operation.name, step.address, self.stage
        );

        let index = self.records.len();
        self.records.push(StepRecord {
            step,
            completion: Completion::Pending,
            stage: self.stage,
        });
        let previous = self.active.replace(index);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.execute(self, &operation)))
            .unwrap_or_else(|payload| Err(ControllerError::HandlerPanicked(panic_message(payload.as_ref()))));
        self.active = Some(index);

        let pending = self.records.get(index).is_some_and(StepRecord::is_pending);
        match outcome {
            Ok(()) if pending => {
                error!(
                    "Handler for '{}' at {} returned without completing its step",
                    operation.name, operation.address
                );
                self.record_failure(
                    response,
                    "Operation handler failed to complete".to_string(),
                    ErrorCategory::Server,
                );
                self.result_action = ResultAction::Rollback;
                self.complete_on_behalf(index);
            }
            Err(err) if pending => {
                self.handle_step_error(index, &err);
                self.complete_on_behalf(index);
            }
            Err(err) => {
                error!(
                    "Handler for '{}' at {} failed after completing its step: {err}",
                    operation.name, operation.address
                );
                self.record_failure(
                    response,
                    format!("Operation handler failed after completing: {err}"),
                    ErrorCategory::Defect,
                );
            }
            Ok(()) => {}
        }

        let recursive = matches!(
            self.records.get(index).map(|record| &record.completion),
            Some(Completion::Recursive)
        );
        if recursive {
            if let Some(record) = self.records.pop() {
                self.finalize(record);
            }
            self.finalize_deferred();
        }
        self.active = previous;
        recursive
    }

    fn complete_on_behalf(&mut self, index: usize) {
        if let Some(record) = self.records.get_mut(index) {
            record.completion = Completion::Recursive;
        }
        self.run_steps();
        self.active = Some(index);
    }

    fn handle_step_error(&mut self, index: usize, err: &ControllerError) {
        let Some(record) = self.records.get(index) else {
            return;
        };
        let response = record.step.response;
        let stage = record.stage;
        let name = record.step.operation.name.clone();
        let address = record.step.address.clone();

        let kind = err.category();
        let description = match kind {
            ErrorCategory::Client | ErrorCategory::Timeout | ErrorCategory::Cancelled => err.to_string(),
            ErrorCategory::Server | ErrorCategory::Defect => format!("Operation handler failed: {err}"),
        };
        match kind {
            ErrorCategory::Client if self.is_booting() => {
                error!("Boot operation '{name}' at {address} failed: {err}");
            }
            ErrorCategory::Client => debug!("Operation '{name}' at {address} failed: {err}"),
            ErrorCategory::Cancelled => {
                debug!("Operation '{name}' at {address} cancelled");
                self.cancelled = true;
            }
            ErrorCategory::Timeout => warn!("Operation '{name}' at {address} timed out: {err}"),
            ErrorCategory::Server | ErrorCategory::Defect => {
                error!("Handler for '{name}' at {address} failed in stage {stage}: {err}");
            }
        }

        self.record_failure(response, description, kind);
        if !kind.is_client() {
            self.result_action = ResultAction::Rollback;
        }
    }

    fn finalize_deferred(&mut self) {
        while self.records.last().is_some_and(StepRecord::is_deferred) {
            if let Some(record) = self.records.pop() {
                self.finalize(record);
            }
        }
    }

    fn finalize(&mut self, record: StepRecord) {
        let StepRecord { step, completion, .. } = record;
        let rolling_back = self.result_action.is_rollback();

        let rollback_outcome = self.rollback_outcome();
        if let Some(response) = self.responses.get_mut(step.response.0) {
            if rolling_back {
                response.outcome = rollback_outcome;
                response.rolled_back = true;
                response.compensating_operation = None;
            } else if response.failure_description.is_some() {
                response.outcome = Outcome::Failed;
            } else {
                response.outcome = Outcome::Success;
            }
        }

        if rolling_back && let Completion::Deferred(Some(rollback)) = completion {
            let previous = self.active.take();
            let operation = Arc::clone(&step.operation);
            let result = panic::catch_unwind(AssertUnwindSafe(|| rollback(self, &operation)));
            if let Err(payload) = result {
                error!(
                    "Rollback handler for '{}' at {} panicked: {}",
                    operation.name,
                    operation.address,
                    panic_message(payload.as_ref())
                );
            }
            self.active = previous;
        }
    }

    fn conclude(&mut self) {
        if self.concluded {
            return;
        }
        self.concluded = true;
        self.stage = Stage::Done;

        if self.rollback_only && !self.result_action.is_rollback() {
            debug!("Rolling back operation marked rollback-only");
            self.result_action = ResultAction::Rollback;
        }
        if !self.result_action.is_rollback() {
            self.prepare_commit();
        }

        if let Some(transaction) = self.transaction.take() {
            let id = transaction.id();
            let outcome = if self.result_action.is_rollback() {
                transaction.rollback()
            } else {
                transaction.commit()
            };
            if !outcome.is_committed() {
                self.result_action = ResultAction::Rollback;
            }
            debug!("Transaction {id} {outcome:?}");
        }

        if self.result_action.is_rollback() {
            self.mark_rolled_back();
        }
    }

    /// Every slot reports the rollback, including those of steps that never
    /// ran.
    fn mark_rolled_back(&mut self) {
        let outcome = self.rollback_outcome();
        for response in &mut self.responses {
            response.outcome = outcome;
            response.rolled_back = true;
            response.compensating_operation = None;
        }
    }

    fn rollback_outcome(&self) -> Outcome {
        if self.cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Failed
        }
    }

    fn prepare_commit(&mut self) {
        if let Some(working) = self.working.take() {
            let persistence = if self.kind == ContextKind::Operation {
                match self.shared.persister.store(&working, &self.affected) {
                    Ok(resource) => Some(resource),
                    Err(err) => {
                        let err = ControllerError::Persistence(format!("{err:#}"));
                        error!("{err}");
                        let target = self.failure_target();
                        self.record_failure(target, err.to_string(), ErrorCategory::Server);
                        self.result_action = ResultAction::Rollback;
                        return;
                    }
                }
            } else {
                None
            };

            let commit = ModelCommit {
                shared: Arc::clone(&self.shared),
                model: Some(working),
            };
            if let Some(transaction) = self.transaction.as_mut() {
                transaction.register_resource(Box::new(commit));
                if let Some(persistence) = persistence {
                    transaction.register_resource(persistence);
                }
            }
        }

        if let Some(control) = self.control.clone() {
            let mut prepared = self.responses.first().cloned().unwrap_or_default();
            prepared.outcome = Outcome::Success;
            let mut vote = PreparedVote::default();
            control.operation_prepared(&mut vote, &prepared);
            if !vote.is_commit() {
                debug!("Transaction control voted to roll back");
                self.result_action = ResultAction::Rollback;
            }
        }
    }

    fn undo_runtime_changes(&mut self) {
        for name in mem::take(&mut self.installed_services).into_iter().rev() {
            if self.shared.services.remove(&name).is_some() {
                debug!("Removed service {name} installed by a rolled back operation");
            }
        }
        for (name, descriptor) in mem::take(&mut self.removed_services).into_iter().rev() {
            if self.shared.services.state(&name).is_some() {
                continue;
            }
            match self.shared.services.install(name.clone(), descriptor) {
                Ok(()) => debug!("Restored service {name} removed by a rolled back operation"),
                Err(err) => error!("Failed to restore service {name}: {err}"),
            }
        }
    }

    fn revert_process_state(&mut self) {
        if let Some(stamp) = self.restart_stamp.take() {
            self.shared.process_state.revert_restart_required(stamp);
        }
        if let Some(stamp) = self.reload_stamp.take() {
            self.shared.process_state.revert_reload_required(stamp);
        }
    }

    // ========================================================================
    // Concurrent boot support
    // ========================================================================

    /// Take the RUNTIME batches diverted so far, one per subsystem.
    pub(crate) fn take_parallel_batches(&mut self) -> Vec<(String, Vec<Step>)> {
        self.parallel
            .as_mut()
            .map(|parallel| {
                parallel.coordinator_added = false;
                mem::take(&mut parallel.batches).into_iter().collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn runtime_child_seed(&self) -> RuntimeChildSeed {
        RuntimeChildSeed {
            shared: Arc::clone(&self.shared),
            options: ContextOptions {
                kind: ContextKind::RuntimeChild,
                caller: self.caller.clone(),
                headers: self.headers,
                control: None,
                cancel: Arc::clone(&self.cancel),
                permit: self.permit,
            },
            snapshot: Arc::new(self.view().clone()),
        }
    }

    /// Run one batch of RUNTIME steps in a child context.
    pub(crate) fn run_runtime_batch(seed: RuntimeChildSeed, steps: Vec<Step>) -> ChildOutcome {
        let mut child = Self::new(seed.shared, seed.options);
        child.snapshot = seed.snapshot;

        let mut slots = Vec::with_capacity(steps.len());
        for mut step in steps {
            let parent = step.response;
            step.response = child.new_response();
            slots.push((step.response, parent));
            child.queues[1].push_back(step);
        }
        child.run();

        let failures = slots
            .into_iter()
            .filter_map(|(id, parent)| {
                let response = child.responses.get(id.0)?;
                let description = response.failure_description.clone()?;
                Some((parent, description, response.failure_kind.unwrap_or(ErrorCategory::Server)))
            })
            .collect();
        ChildOutcome {
            failures,
            installed: mem::take(&mut child.installed_services),
            removed: mem::take(&mut child.removed_services),
            cancelled: child.cancelled,
        }
    }

    pub(crate) fn merge_child_outcome(&mut self, outcome: ChildOutcome) {
        if outcome.cancelled {
            self.cancelled = true;
        }
        for (response, description, kind) in outcome.failures {
            self.record_failure(response, description, kind);
        }
        if !outcome.installed.is_empty() || !outcome.removed.is_empty() {
            self.runtime_affected = true;
        }
        self.installed_services.extend(outcome.installed);
        self.removed_services.extend(outcome.removed);
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

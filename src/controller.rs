//! # Model Controller
//!
//! Entry point for executing management operations against the model.
//!
//! ## Core Concepts
//!
//! - **Published model**: the committed resource tree. Readers load it
//!   without locking; a committing operation replaces it atomically.
//! - **Registry**: handlers keyed by address pattern and operation name.
//! - **Execution**: each call to [`ModelController::execute`] runs the
//!   operation in its own [`OperationContext`] under a fresh permit, so
//!   operations that write the model are serialized by the controller lock.
//! - **Transaction control**: callers that coordinate several controllers
//!   pass a [`TransactionControl`], which sees the prepared result and
//!   votes to commit or roll back.
//!
//! ## Example
//!
//! ```ignore
//! let controller = ModelController::new(ControllerConfig::default())?;
//! controller.register_global_operations()?;
//! let response = controller.execute(Operation::new("read-resource", PathAddress::EMPTY));
//! assert!(response.is_success());
//! ```

use crate::access::{Authorizer, CallerContext, PermitAll};
use crate::config::ControllerConfig;
use crate::context::{ContextKind, ContextOptions, OperationContext, PrepareStepHandler};
use crate::error::{ErrorCategory, Result};
use crate::expression::{ExpressionResolver, PropertyExpressionResolver};
use crate::handlers::{ProxyController, ProxyStepHandler};
use crate::operation::{Operation, OperationResponse};
use crate::persister::{ConfigurationPersister, NullPersister};
use crate::process_state::{ControlledProcessState, ProcessState};
use crate::registry::OperationRegistry;
use crate::resource::Resource;
use crate::services::{InMemoryServiceContainer, ServiceContainer};
use arc_swap::ArcSwap;
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use txkit::{LockObserver, Permit, ReentrantPermitLock};

// ============================================================================
// Transaction control
// ============================================================================

/// Vote handed to a [`TransactionControl`] once an operation is prepared.
///
/// The operation rolls back unless the control calls [`PreparedVote::commit`].
#[derive(Debug, Default)]
pub struct PreparedVote {
    commit: bool,
}

impl PreparedVote {
    pub fn commit(&mut self) {
        self.commit = true;
    }

    pub fn rollback(&mut self) {
        self.commit = false;
    }

    pub fn is_commit(&self) -> bool {
        self.commit
    }
}

/// Decides whether a prepared operation commits.
///
/// Called after every step has run successfully and before the model is
/// published. The response carries the prepared result.
pub trait TransactionControl: Send + Sync {
    fn operation_prepared(&self, vote: &mut PreparedVote, response: &OperationResponse);
}

/// Transaction control that commits every prepared operation.
pub struct CommitAll;

impl TransactionControl for CommitAll {
    fn operation_prepared(&self, vote: &mut PreparedVote, _response: &OperationResponse) {
        vote.commit();
    }
}

// ============================================================================
// Controller
// ============================================================================

/// State shared by the controller and every operation context.
pub(crate) struct ControllerShared {
    pub(crate) root: ArcSwap<Resource>,
    pub(crate) registry: OperationRegistry,
    pub(crate) lock: ReentrantPermitLock,
    pub(crate) config: ArcSwap<ControllerConfig>,
    pub(crate) services: Arc<dyn ServiceContainer>,
    pub(crate) persister: Arc<dyn ConfigurationPersister>,
    pub(crate) resolver: Arc<dyn ExpressionResolver>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) process_state: ControlledProcessState,
}

/// Builder for [`ModelController`].
#[derive(Default)]
pub struct ControllerBuilder {
    config: ControllerConfig,
    services: Option<Arc<dyn ServiceContainer>>,
    persister: Option<Arc<dyn ConfigurationPersister>>,
    resolver: Option<Arc<dyn ExpressionResolver>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    lock_observer: Option<Arc<dyn LockObserver>>,
    model: Option<Resource>,
}

impl ControllerBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn services(mut self, services: Arc<dyn ServiceContainer>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn ConfigurationPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Observe acquisitions and releases of the controller lock.
    pub fn lock_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.lock_observer = Some(observer);
        self
    }

    /// Start from an existing model instead of an empty root.
    pub fn model(mut self, model: Resource) -> Self {
        self.model = Some(model);
        self
    }

    pub fn build(self) -> anyhow::Result<ModelController> {
        self.config.validate()?;
        let lock = match self.lock_observer {
            Some(observer) => ReentrantPermitLock::with_observer(observer),
            None => ReentrantPermitLock::new(),
        };
        let shared = ControllerShared {
            root: ArcSwap::from_pointee(self.model.unwrap_or_default()),
            registry: OperationRegistry::new(),
            lock,
            config: ArcSwap::from_pointee(self.config),
            services: self
                .services
                .unwrap_or_else(|| Arc::new(InMemoryServiceContainer::new())),
            persister: self.persister.unwrap_or_else(|| Arc::new(NullPersister)),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(PropertyExpressionResolver::new())),
            authorizer: self.authorizer.unwrap_or_else(|| Arc::new(PermitAll)),
            process_state: ControlledProcessState::new(),
        };
        Ok(ModelController {
            shared: Arc::new(shared),
        })
    }
}

/// Executes management operations against a resource model.
///
/// Cloning is cheap; clones share the model, registry and lock.
#[derive(Clone)]
pub struct ModelController {
    pub(crate) shared: Arc<ControllerShared>,
}

impl ModelController {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Controller with default collaborators and an empty model.
    pub fn new(config: ControllerConfig) -> anyhow::Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.shared.registry
    }

    /// The last committed model.
    pub fn root(&self) -> Arc<Resource> {
        self.shared.root.load_full()
    }

    pub fn config(&self) -> Arc<ControllerConfig> {
        self.shared.config.load_full()
    }

    /// Replace the configuration. Operations already running keep the
    /// configuration they started with.
    pub fn reload_config(&self, config: ControllerConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.shared.config.store(Arc::new(config));
        info!("Controller configuration reloaded");
        Ok(())
    }

    pub fn process_state(&self) -> ProcessState {
        self.shared.process_state.state()
    }

    /// Mark a pending reload or restart as done.
    pub fn complete_reload(&self) {
        self.shared.process_state.set_running();
    }

    pub fn services(&self) -> &Arc<dyn ServiceContainer> {
        &self.shared.services
    }

    /// Register the read and write operations every resource inherits.
    pub fn register_global_operations(&self) -> Result<()> {
        crate::handlers::global::register_global_operations(&self.shared.registry)
    }

    /// Route operations at and below the proxy's address to it.
    pub fn register_proxy(&self, proxy: Arc<dyn ProxyController>) -> Result<()> {
        let address = proxy.proxy_address().clone();
        self.shared
            .registry
            .register_proxy(&address, Arc::new(ProxyStepHandler::new(proxy)))
    }

    /// Execute an operation for an anonymous caller.
    pub fn execute(&self, operation: Operation) -> OperationResponse {
        self.execute_with(operation, CallerContext::default(), None)
    }

    /// Execute an operation for `caller`, consulting `control` before commit.
    pub fn execute_with(
        &self,
        operation: Operation,
        caller: CallerContext,
        control: Option<Arc<dyn TransactionControl>>,
    ) -> OperationResponse {
        self.run_operation(operation, caller, control, Arc::new(AtomicBool::new(false)))
    }

    /// Execute an operation on a worker thread.
    ///
    /// The returned handle delivers the response once and can cancel the
    /// operation while it runs.
    pub fn execute_async(&self, operation: Operation, caller: CallerContext) -> AsyncOperation {
        let (sender, receiver) = mpsc::sync_channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let controller = self.clone();
        let flag = Arc::clone(&cancel);
        let name = operation.name.clone();

        let spawned = thread::Builder::new()
            .name(format!("modelctl-{name}"))
            .spawn(move || {
                let response = controller.run_operation(operation, caller, None, flag);
                if sender.send(response).is_err() {
                    debug!("Async caller dropped before '{name}' completed");
                }
            });
        if let Err(err) = spawned {
            error!("Failed to start operation thread: {err}");
        }
        AsyncOperation { receiver, cancel }
    }

    fn run_operation(
        &self,
        operation: Operation,
        caller: CallerContext,
        control: Option<Arc<dyn TransactionControl>>,
        cancel: Arc<AtomicBool>,
    ) -> OperationResponse {
        let headers = match operation.parsed_headers() {
            Ok(headers) => headers,
            Err(err) => return OperationResponse::failed(err.to_string(), err.category()),
        };
        let permit = Permit::next();
        debug!(
            "Executing '{}' at {} for {} with permit {permit}",
            operation.name,
            operation.address,
            caller.display_name()
        );

        let mut ctx = OperationContext::new(
            Arc::clone(&self.shared),
            ContextOptions {
                kind: ContextKind::Operation,
                caller,
                headers,
                control,
                cancel,
                permit,
            },
        );
        let response = match ctx.add_initial_step(operation, Arc::new(PrepareStepHandler)) {
            Ok(response) => response,
            Err(err) => return OperationResponse::failed(err.to_string(), err.category()),
        };
        ctx.run();
        ctx.take_response(response)
    }
}

/// Handle to an operation running on another thread.
pub struct AsyncOperation {
    receiver: Receiver<OperationResponse>,
    cancel: Arc<AtomicBool>,
}

impl AsyncOperation {
    /// Ask the operation to stop. It rolls back at the next step boundary
    /// or while waiting for the lock or services.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Block until the response arrives.
    pub fn wait(self) -> OperationResponse {
        self.receiver.recv().unwrap_or_else(|_| lost_response())
    }

    /// Wait up to `timeout`; `None` if the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<OperationResponse> {
        match self.receiver.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(lost_response()),
        }
    }
}

fn lost_response() -> OperationResponse {
    OperationResponse::failed("Operation thread ended without a response", ErrorCategory::Server)
}

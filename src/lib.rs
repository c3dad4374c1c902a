//! # modelctl
//!
//! Transactional, staged execution of management operations against a
//! hierarchical resource model.
//!
//! ## Core Concepts
//!
//! - **Address**: a [`PathAddress`] such as `/subsystem=web/connector=http`
//!   names a resource; `*` in place of a value matches every resource of
//!   that type.
//! - **Registry**: handlers are registered per address pattern and
//!   operation name in the [`OperationRegistry`].
//! - **Operation context**: an [`OperationContext`] runs an operation as
//!   steps across the MODEL, RUNTIME and VERIFY stages and then commits or
//!   rolls back everything the steps did.
//! - **Controller**: [`ModelController`] owns the published model and
//!   serializes writers with a permit-keyed reentrant lock.
//!
//! ## Example
//!
//! ```ignore
//! use modelctl::{ModelController, ControllerConfig, Operation};
//!
//! let controller = ModelController::new(ControllerConfig::default())?;
//! controller.register_global_operations()?;
//! controller.registry().register_resource(&"/subsystem=*".parse()?, definition.clone())?;
//! controller.registry().register_operation(
//!     &"/subsystem=*".parse()?,
//!     "add",
//!     Arc::new(AddStepHandler::new(definition)),
//!     OperationFlags::NONE,
//! )?;
//!
//! let response = controller.execute(
//!     Operation::new("add", "/subsystem=web".parse()?).param("port", 8080),
//! );
//! assert!(response.is_success());
//! ```

pub mod access;
pub mod attribute;
mod boot;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod expression;
pub mod handlers;
pub mod operation;
pub mod persister;
pub mod process_state;
pub mod registry;
pub mod resource;
pub mod services;

#[cfg(test)]
mod testing;

pub use access::{Authorizer, CallerContext};
pub use attribute::{AttributeDefinition, ResourceDefinition};
pub use config::ControllerConfig;
pub use context::{OperationContext, OperationStepHandler, ResultAction, Stage, handler_fn};
pub use controller::{AsyncOperation, ModelController, PreparedVote, TransactionControl};
pub use error::{ControllerError, ErrorCategory, Result};
pub use operation::{Operation, OperationResponse, Outcome};
pub use pathaddr::{PathAddress, PathElement};
pub use registry::{OperationFlags, OperationRegistry};
pub use resource::Resource;

//! Reusable step handlers.
//!
//! - [`AddStepHandler`] / [`RemoveStepHandler`]: resource lifecycle with
//!   optional runtime work
//! - [`CompositeOperationHandler`]: runs a list of operations as one unit
//! - [`ProxyStepHandler`]: forwards operations to another controller
//! - [`global`]: read and write operations every resource inherits

mod add;
mod composite;
pub mod global;
mod proxy;
mod remove;

pub use add::{AddStepHandler, RuntimeHandler};
pub use composite::CompositeOperationHandler;
pub use proxy::{LocalProxyController, ProxyController, ProxyResult, ProxyStepHandler, ProxyTransaction};
pub use remove::RemoveStepHandler;

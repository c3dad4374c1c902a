//! # TxKit
//!
//! Coordination primitives for a single-writer management controller.
//!
//! ## Core Concepts
//!
//! - **Permit**: an opaque identity for one logical operation. A permit may
//!   be shared by several threads working on the same operation.
//! - **ReentrantPermitLock**: an exclusive lock owned by a permit rather
//!   than a thread. The holding permit may re-acquire without blocking.
//! - **ControllerTransaction**: an ordered set of resources that are
//!   committed or rolled back together when an operation completes.
//!
//! ## Example
//!
//! ```ignore
//! use txkit::{ControllerTransaction, Permit, ReentrantPermitLock, CallbackResource};
//!
//! let lock = ReentrantPermitLock::new();
//! let permit = Permit::next();
//! lock.lock(permit);
//! lock.lock(permit); // reentrant
//! lock.unlock(permit)?;
//! lock.unlock(permit)?;
//!
//! let mut tx = ControllerTransaction::new();
//! tx.register_resource(Box::new(CallbackResource::new(
//!     || { println!("commit"); Ok(()) },
//!     || { println!("rollback"); Ok(()) },
//! )));
//! assert!(tx.commit().is_committed());
//! ```

pub mod error;
pub mod lock;
pub mod transaction;

pub use error::{LockError, Result};
pub use lock::{LockObserver, Permit, ReentrantPermitLock};
pub use transaction::{
    CallbackResource, ControllerResource, ControllerTransaction, Synchronization,
    TransactionOutcome,
};

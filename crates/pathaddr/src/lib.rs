//! # PathAddr
//!
//! Immutable hierarchical addresses for management model trees.
//!
//! An address is an ordered list of `key=value` elements, for example
//! `/subsystem=logging/handler=console`. The same type addresses concrete
//! resources in a model tree and registration patterns in a handler
//! registry, where an element value may be the wildcard `*`.
//!
//! ## Core Concepts
//!
//! - **PathElement**: one `key=value` step, possibly a wildcard
//! - **PathAddress**: an ordered sequence of elements, unique per key
//! - **PathCursor**: a bidirectional cursor used for backtracking lookups
//!
//! ## Example
//!
//! ```ignore
//! use pathaddr::{PathAddress, PathElement};
//!
//! let address: PathAddress = "/subsystem=logging/handler=console".parse()?;
//! assert_eq!(address.len(), 2);
//!
//! let pattern = PathAddress::new([
//!     PathElement::new("subsystem", "logging")?,
//!     PathElement::wildcard("handler")?,
//! ])?;
//! assert!(address.matches(&pattern));
//! ```

mod address;
mod element;
mod error;

pub use address::{PathAddress, PathCursor};
pub use element::{PathElement, WILDCARD_VALUE};
pub use error::{AddressError, Result};

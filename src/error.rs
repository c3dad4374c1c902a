//! Error types for operation execution.
//!
//! Errors are categorized so the controller can decide whether a failure
//! is the caller's mistake, a timeout worth retrying, or a server-side
//! problem that needs operator attention. The category is carried into
//! every failed [`OperationResponse`](crate::operation::OperationResponse).

use pathaddr::{AddressError, PathAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use txkit::LockError;

/// Categories of operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Malformed request, failed validation, missing resource, denied access
    Client,
    /// Lock acquisition or service settle wait ran out of time
    Timeout,
    /// Unexpected handler or collaborator failure
    Server,
    /// Handler misbehaved after completing; state may be inconsistent
    Defect,
    /// Caller cancelled the operation
    Cancelled,
}

impl ErrorCategory {
    /// Whether resubmitting the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether the failure was caused by the request itself.
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Client => "Invalid request",
            Self::Timeout => "Timed out",
            Self::Server => "Server failure",
            Self::Defect => "Handler defect",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            Self::Client => "Correct the operation and submit it again",
            Self::Timeout => "Retry once concurrent operations have finished",
            Self::Server => "Check the controller log for the underlying failure",
            Self::Defect => "Report the handler defect; the model may need inspection",
            Self::Cancelled => "No action needed - the operation was rolled back",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors raised while executing management operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Address could not be built or parsed
    #[error(transparent)]
    Address(#[from] AddressError),

    /// No resource exists at the address
    #[error("Resource {address} not found")]
    ResourceNotFound {
        /// The address that was looked up
        address: PathAddress,
    },

    /// A resource already exists at the address being added
    #[error("Duplicate resource {address}")]
    DuplicateResource {
        /// The address of the existing resource
        address: PathAddress,
    },

    /// No resource type is registered for the address
    #[error("No such resource type {address}")]
    NoSuchResourceType {
        /// The unregistered address
        address: PathAddress,
    },

    /// The resource type exists but has no handler for the operation
    #[error("No handler for operation '{operation}' at address {address}")]
    NoHandler {
        /// Operation name
        operation: String,
        /// Target address
        address: PathAddress,
    },

    /// A required attribute or parameter was not supplied
    #[error("'{attribute}' is required")]
    MissingRequired {
        /// Name of the missing attribute
        attribute: String,
    },

    /// An attribute value failed type checking or validation
    #[error("'{attribute}' is invalid: {reason}")]
    InvalidAttribute {
        /// Attribute name
        attribute: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Two mutually exclusive attributes were both defined
    #[error("'{attribute}' cannot be defined together with {conflicting}")]
    AlternativeConflict {
        /// Attribute being validated
        attribute: String,
        /// The alternative that is also defined
        conflicting: String,
    },

    /// An attribute is defined but an attribute it requires is not
    #[error("'{attribute}' requires '{required}' to be defined")]
    RequiresMissing {
        /// Attribute being validated
        attribute: String,
        /// The co-required attribute
        required: String,
    },

    /// The resource type has no such attribute
    #[error("Unknown attribute '{attribute}' at {address}")]
    UnknownAttribute {
        /// Attribute name
        attribute: String,
        /// Resource address
        address: PathAddress,
    },

    /// Request structure is invalid
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// An operation header has an invalid value
    #[error("Invalid value for operation header '{header}': {reason}")]
    InvalidHeader {
        /// Header name
        header: String,
        /// Why the value was rejected
        reason: String,
    },

    /// An expression could not be resolved
    #[error("Cannot resolve expression '{expression}': {reason}")]
    Expression {
        /// Expression text
        expression: String,
        /// Why resolution failed
        reason: String,
    },

    /// The authorizer denied the operation
    #[error("Not authorized to execute '{operation}' at {address}: {reason}")]
    Unauthorized {
        /// Operation name
        operation: String,
        /// Target address
        address: PathAddress,
        /// Reason reported by the authorizer
        reason: String,
    },

    /// A handler rejected the operation
    #[error("{0}")]
    OperationFailed(String),

    /// A handler is already registered for the pattern and name
    #[error("Duplicate registration of operation '{operation}' at {address}")]
    DuplicateRegistration {
        /// Operation name
        operation: String,
        /// Registration pattern
        address: PathAddress,
    },

    /// A step was added to a stage that cannot accept it
    #[error("Cannot add a step for stage {requested} while in stage {current}")]
    InvalidStage {
        /// Stage the step targeted
        requested: String,
        /// Stage the context is in
        current: String,
    },

    /// A model write was attempted where it is not permitted
    #[error("Cannot write to {address}: {reason}")]
    WriteNotPermitted {
        /// Target address
        address: PathAddress,
        /// Why the write was refused
        reason: &'static str,
    },

    /// An action was attempted in a stage that does not permit it
    #[error("{action} is not permitted in stage {stage}")]
    StageViolation {
        /// What was attempted
        action: &'static str,
        /// Stage the context is in
        stage: String,
    },

    /// Model navigation used a wildcard element
    #[error("Wildcard element in resource address {address}")]
    WildcardNavigation {
        /// The offending address
        address: PathAddress,
    },

    /// Lock acquisition failed
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A runtime service could not be installed or started
    #[error("Service {name}: {reason}")]
    Service {
        /// Service name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Services did not settle before the blocking timeout
    #[error("Timed out waiting for services to start: {pending}")]
    ServiceTimeout {
        /// Services still starting
        pending: String,
    },

    /// Configuration could not be persisted
    #[error("Failed to persist configuration change: {0}")]
    Persistence(String),

    /// A proxied controller failed
    #[error("Proxied operation failed: {0}")]
    Proxy(String),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A handler panicked
    #[error("Operation handler panicked: {0}")]
    HandlerPanicked(String),

    /// JSON (de)serialization error
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControllerError {
    /// Create a client failure with a message, the usual way handlers reject input.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::OperationFailed(message.into())
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Lock(LockError::Timeout { .. }) | Self::ServiceTimeout { .. } => {
                ErrorCategory::Timeout
            }
            Self::Lock(LockError::Cancelled) | Self::Cancelled => ErrorCategory::Cancelled,
            Self::Lock(LockError::NotHolder { .. })
            | Self::DuplicateRegistration { .. }
            | Self::InvalidStage { .. }
            | Self::WriteNotPermitted { .. }
            | Self::StageViolation { .. }
            | Self::WildcardNavigation { .. }
            | Self::Service { .. }
            | Self::Persistence(_)
            | Self::Proxy(_)
            | Self::HandlerPanicked(_) => ErrorCategory::Server,
            Self::Address(_)
            | Self::ResourceNotFound { .. }
            | Self::DuplicateResource { .. }
            | Self::NoSuchResourceType { .. }
            | Self::NoHandler { .. }
            | Self::MissingRequired { .. }
            | Self::InvalidAttribute { .. }
            | Self::AlternativeConflict { .. }
            | Self::RequiresMissing { .. }
            | Self::UnknownAttribute { .. }
            | Self::InvalidOperation(_)
            | Self::InvalidHeader { .. }
            | Self::Expression { .. }
            | Self::Unauthorized { .. }
            | Self::OperationFailed(_)
            | Self::Json(_) => ErrorCategory::Client,
        }
    }

    pub fn is_client(&self) -> bool {
        self.category().is_client()
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_category_client() {
        let err = ControllerError::MissingRequired {
            attribute: "value".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Client);
        assert!(err.is_client());
        assert!(err.to_string().contains("'value' is required"));
    }

    #[test]
    fn test_category_timeout_is_retryable() {
        let err = ControllerError::from(LockError::Timeout {
            timeout: Duration::from_secs(300),
        });
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_category_cancelled() {
        assert_eq!(
            ControllerError::from(LockError::Cancelled).category(),
            ErrorCategory::Cancelled
        );
        assert_eq!(ControllerError::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_category_server() {
        let err = ControllerError::HandlerPanicked("boom".to_string());
        assert_eq!(err.category(), ErrorCategory::Server);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_category_serializes_kebab_case() {
        let json = serde_json::to_value(ErrorCategory::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!("cancelled"));
        assert_eq!(ErrorCategory::Defect.to_string(), "Handler defect");
    }
}

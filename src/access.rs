//! Caller identity and authorization.
//!
//! The caller context travels explicitly with each operation so that audit
//! identity stays bound to one in-flight operation, including its nested
//! steps and any proxied sub-operations.

use crate::operation::Operation;
use serde::{Deserialize, Serialize};

/// How the caller reached the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMechanism {
    #[default]
    InVm,
    Native,
    Http,
}

/// Identity of the caller for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    /// Authenticated principal, if any
    pub identity: Option<String>,
    pub access_mechanism: AccessMechanism,
    /// Remote peer address, if the call came over a transport
    pub remote_address: Option<String>,
}

impl CallerContext {
    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.identity.as_deref().unwrap_or("anonymous")
    }
}

/// What an operation does to the model or runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    ReadConfig,
    WriteConfig,
    ReadRuntime,
    WriteRuntime,
}

/// Decision of an [`Authorizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationResult {
    Permit,
    Deny(String),
}

impl AuthorizationResult {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permit)
    }
}

/// Consulted before an operation's handler runs.
pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        caller: &CallerContext,
        operation: &Operation,
        effects: &[Effect],
    ) -> AuthorizationResult;
}

/// Authorizer that permits everything.
pub struct PermitAll;

impl Authorizer for PermitAll {
    fn authorize(&self, _caller: &CallerContext, _operation: &Operation, _effects: &[Effect]) -> AuthorizationResult {
        AuthorizationResult::Permit
    }
}

/// Authorizer that denies writes to callers without an identity.
pub struct RequireIdentityForWrites;

impl Authorizer for RequireIdentityForWrites {
    fn authorize(&self, caller: &CallerContext, _operation: &Operation, effects: &[Effect]) -> AuthorizationResult {
        let writes = effects
            .iter()
            .any(|e| matches!(e, Effect::WriteConfig | Effect::WriteRuntime));
        if writes && caller.identity.is_none() {
            return AuthorizationResult::Deny("anonymous callers may not modify the model".to_string());
        }
        AuthorizationResult::Permit
    }
}

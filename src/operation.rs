//! Operations and operation responses.
//!
//! Both travel as flat JSON objects:
//!
//! ```text
//! {"operation": "add", "address": [{"subsystem": "foo"}], "value": 5,
//!  "operation-headers": {"blocking-timeout": 30}}
//! ```

use crate::error::{ControllerError, ErrorCategory, Result};
use pathaddr::PathAddress;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Well-known operation, parameter and header names.
pub mod names {
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const COMPOSITE: &str = "composite";
    pub const READ_RESOURCE: &str = "read-resource";
    pub const READ_ATTRIBUTE: &str = "read-attribute";
    pub const WRITE_ATTRIBUTE: &str = "write-attribute";
    pub const UNDEFINE_ATTRIBUTE: &str = "undefine-attribute";
    pub const READ_CHILDREN_NAMES: &str = "read-children-names";
    pub const READ_CHILDREN_TYPES: &str = "read-children-types";
    pub const READ_OPERATION_NAMES: &str = "read-operation-names";

    pub const NAME: &str = "name";
    pub const VALUE: &str = "value";
    pub const STEPS: &str = "steps";
    pub const RECURSIVE: &str = "recursive";
    pub const INCLUDE_DEFAULTS: &str = "include-defaults";
    pub const CHILD_TYPE: &str = "child-type";

    pub const BLOCKING_TIMEOUT: &str = "blocking-timeout";
    pub const ROLLBACK_ON_RUNTIME_FAILURE: &str = "rollback-on-runtime-failure";
    pub const ALLOW_RESOURCE_SERVICE_RESTART: &str = "allow-resource-service-restart";

    pub const OPERATION_REQUIRES_RELOAD: &str = "operation-requires-reload";
    pub const OPERATION_REQUIRES_RESTART: &str = "operation-requires-restart";
    pub const RUNTIME_UPDATE_SKIPPED: &str = "runtime-update-skipped";
    pub const PROCESS_STATE: &str = "process-state";
}

/// An addressed, named request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "operation")]
    pub name: String,

    #[serde(default)]
    pub address: PathAddress,

    #[serde(
        rename = "operation-headers",
        default,
        skip_serializing_if = "Map::is_empty"
    )]
    pub headers: Map<String, Value>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, address: PathAddress) -> Self {
        Self {
            name: name.into(),
            address,
            headers: Map::new(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Builder-style header setter.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parse an operation from its JSON form.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A defined (non-null) parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name).filter(|v| !v.is_null())
    }

    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get(name).ok_or_else(|| ControllerError::MissingRequired {
            attribute: name.to_string(),
        })
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| ControllerError::InvalidAttribute {
                attribute: name.to_string(),
                reason: "expected a string".to_string(),
            })
    }

    /// Boolean parameter, accepting `true`/`false` strings.
    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value_as_bool(value).ok_or_else(|| ControllerError::InvalidAttribute {
                attribute: name.to_string(),
                reason: format!("expected a boolean, got {value}"),
            }),
        }
    }

    /// Copy of this operation re-targeted at `address`.
    pub fn with_address(&self, address: PathAddress) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    /// Validate and decode the recognised headers.
    pub fn parsed_headers(&self) -> Result<OperationHeaders> {
        let mut headers = OperationHeaders::default();

        if let Some(value) = self.headers.get(names::BLOCKING_TIMEOUT) {
            let seconds = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .filter(|s| *s > 0)
                .ok_or_else(|| ControllerError::InvalidHeader {
                    header: names::BLOCKING_TIMEOUT.to_string(),
                    reason: format!("{value} is not a positive integer"),
                })?;
            headers.blocking_timeout = Some(Duration::from_secs(seconds));
        }

        for (name, slot) in [
            (
                names::ROLLBACK_ON_RUNTIME_FAILURE,
                &mut headers.rollback_on_runtime_failure,
            ),
            (
                names::ALLOW_RESOURCE_SERVICE_RESTART,
                &mut headers.allow_resource_service_restart,
            ),
        ] {
            if let Some(value) = self.headers.get(name) {
                *slot = value_as_bool(value).ok_or_else(|| ControllerError::InvalidHeader {
                    header: name.to_string(),
                    reason: format!("{value} is not a boolean"),
                })?;
            }
        }

        Ok(headers)
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decoded operation headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHeaders {
    /// Override for the lock and service wait timeout
    pub blocking_timeout: Option<Duration>,
    /// Roll back the whole operation when a RUNTIME step fails
    pub rollback_on_runtime_failure: bool,
    /// Permit restarting services of other resources
    pub allow_resource_service_restart: bool,
}

impl Default for OperationHeaders {
    fn default() -> Self {
        Self {
            blocking_timeout: None,
            rollback_on_runtime_failure: true,
            allow_resource_service_restart: false,
        }
    }
}

/// Terminal state of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Success,
    Failed,
    Cancelled,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The structured result of executing an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationResponse {
    pub outcome: Outcome,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub rolled_back: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorCategory>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub response_headers: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_operation: Option<Operation>,
}

impl OperationResponse {
    pub fn success(result: Value) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn failed(description: impl Into<String>, kind: ErrorCategory) -> Self {
        Self {
            outcome: Outcome::Failed,
            failure_description: Some(description.into()),
            failure_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn has_failure(&self) -> bool {
        self.failure_description.is_some()
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.response_headers.get(name)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_format() {
        let value = json!({
            "operation": "add",
            "address": [{"subsystem": "foo"}],
            "value": 5,
            "operation-headers": {"blocking-timeout": 30}
        });
        let op = Operation::from_value(value.clone()).unwrap();
        assert_eq!(op.name, "add");
        assert_eq!(op.address.to_string(), "/subsystem=foo");
        assert_eq!(op.get("value"), Some(&json!(5)));
        assert_eq!(op.to_value(), value);
    }

    #[test]
    fn test_missing_address_is_root() {
        let op = Operation::from_value(json!({"operation": "read-resource"})).unwrap();
        assert_eq!(op.address, PathAddress::EMPTY);
        assert!(Operation::from_value(json!({"address": []})).is_err());
    }

    #[test]
    fn test_null_param_is_undefined() {
        let op = Operation::new("add", PathAddress::EMPTY).param("value", Value::Null);
        assert!(op.get("value").is_none());
        assert!(matches!(
            op.require("value"),
            Err(ControllerError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_blocking_timeout_header() {
        let op = Operation::new("add", PathAddress::EMPTY).header(names::BLOCKING_TIMEOUT, 30);
        let headers = op.parsed_headers().unwrap();
        assert_eq!(headers.blocking_timeout, Some(Duration::from_secs(30)));
        assert!(headers.rollback_on_runtime_failure);

        for bad in [json!(0), json!(-5), json!("soon"), json!(1.5)] {
            let op = Operation::new("add", PathAddress::EMPTY).header(names::BLOCKING_TIMEOUT, bad);
            assert!(matches!(
                op.parsed_headers(),
                Err(ControllerError::InvalidHeader { .. })
            ));
        }
    }

    #[test]
    fn test_boolean_headers() {
        let op = Operation::new("add", PathAddress::EMPTY)
            .header(names::ROLLBACK_ON_RUNTIME_FAILURE, false)
            .header(names::ALLOW_RESOURCE_SERVICE_RESTART, "true");
        let headers = op.parsed_headers().unwrap();
        assert!(!headers.rollback_on_runtime_failure);
        assert!(headers.allow_resource_service_restart);
    }

    #[test]
    fn test_response_serialization() {
        let response = OperationResponse::failed("boom", ErrorCategory::Client);
        let value = response.to_value();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["failure-description"], "boom");
        assert_eq!(value["failure-kind"], "client");
        assert!(value.get("rolled-back").is_none());

        let ok = OperationResponse::success(json!(1)).to_value();
        assert_eq!(ok, json!({"outcome": "success", "result": 1}));
    }
}

//! Expression resolution for `${name}` and `${name:default}` values.

use crate::error::{ControllerError, Result};
use serde_json::Value;
use std::collections::HashMap;

const ENV_PREFIX: &str = "env.";

/// Resolves expressions embedded in model values.
pub trait ExpressionResolver: Send + Sync {
    /// Return `value` with every expression replaced by its resolved text.
    fn resolve(&self, value: &Value) -> Result<Value>;
}

/// Whether a value is a string holding at least one `${...}` expression.
pub fn is_expression(value: &Value) -> bool {
    value
        .as_str()
        .and_then(|s| s.find("${").map(|start| s[start..].contains('}')))
        .unwrap_or(false)
}

/// Resolver backed by a property map, with `env.` names read from the
/// process environment.
#[derive(Debug, Clone, Default)]
pub struct PropertyExpressionResolver {
    properties: HashMap<String, String>,
}

impl PropertyExpressionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.properties.get(name) {
            return Some(value.clone());
        }
        name.strip_prefix(ENV_PREFIX)
            .and_then(|var| std::env::var(var).ok())
    }

    fn resolve_str(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            out.push_str(&rest[..start]);
            let inner = &rest[start + 2..start + len];
            let (name, default) = match inner.split_once(':') {
                Some((name, default)) => (name, Some(default)),
                None => (inner, None),
            };
            let resolved = self
                .lookup(name)
                .or_else(|| default.map(str::to_string))
                .ok_or_else(|| ControllerError::Expression {
                    expression: text.to_string(),
                    reason: format!("no value for '{name}'"),
                })?;
            out.push_str(&resolved);
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl ExpressionResolver for PropertyExpressionResolver {
    fn resolve(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) if is_expression(value) => Ok(Value::String(self.resolve_str(s)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

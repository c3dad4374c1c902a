//! Typed, validated attribute descriptors.
//!
//! An [`AttributeDefinition`] is a tagged [`AttributeKind`] plus a small set
//! of strategy objects:
//!
//! - [`ParameterValidator`]: rejects values after type coercion
//! - [`ValueCorrector`]: rewrites an incoming value before validation
//! - [`AttributeMarshaller`]: decides whether and how a value is persisted
//!
//! Closures implement the validator and corrector traits directly, so
//! customizing an attribute never needs a new type.

use crate::error::{ControllerError, Result};
use crate::expression::{ExpressionResolver, is_expression};
use crate::operation::Operation;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Kinds
// ============================================================================

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Int,
    Long,
    Double,
    String,
}

impl ValueType {
    fn name(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Int => "INT",
            Self::Long => "LONG",
            Self::Double => "DOUBLE",
            Self::String => "STRING",
        }
    }

    /// Convert `value` to this type, accepting string forms of scalars.
    fn coerce(self, value: &Value) -> std::result::Result<Value, String> {
        let mismatch = || format!("expected {} but got {value}", self.name());
        match (self, value) {
            (Self::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (Self::Int, _) => {
                let n = integer(value).ok_or_else(mismatch)?;
                i32::try_from(n)
                    .map(Value::from)
                    .map_err(|_| format!("{n} is out of range for INT"))
            }
            (Self::Long, _) => integer(value).map(Value::from).ok_or_else(mismatch),
            (Self::Double, Value::Number(n)) => Ok(Value::Number(n.clone())),
            (Self::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            (Self::String, Value::String(_)) => Ok(value.clone()),
            (Self::String, Value::Number(_) | Value::Bool(_)) => Ok(Value::String(value.to_string())),
            _ => Err(mismatch()),
        }
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Shape of an attribute value.
#[derive(Debug, Clone)]
pub enum AttributeKind {
    /// A single primitive
    Simple(ValueType),
    /// A list of primitives
    List(ValueType),
    /// String keys mapping to primitives
    Map(ValueType),
    /// A nested object whose fields have their own definitions
    Object(Vec<AttributeDefinition>),
}

impl AttributeKind {
    fn coerce(&self, value: &Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (Self::Simple(t), _) => t.coerce(value),
            (Self::List(t), Value::Array(items)) => items
                .iter()
                .map(|item| t.coerce(item))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            (Self::Map(t), Value::Object(entries)) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), t.coerce(v)?)))
                .collect::<std::result::Result<Map<_, _>, String>>()
                .map(Value::Object),
            (Self::Object(fields), Value::Object(entries)) => {
                if let Some(unknown) = entries
                    .keys()
                    .find(|k| !fields.iter().any(|f| f.name() == k.as_str()))
                {
                    return Err(format!("unknown field '{unknown}'"));
                }
                let mut out = Map::new();
                for field in fields {
                    let raw = entries.get(field.name()).cloned().unwrap_or(Value::Null);
                    let coerced = field
                        .validate_standalone(&raw)
                        .map_err(|e| e.to_string())?;
                    if !coerced.is_null() {
                        out.insert(field.name().to_string(), coerced);
                    }
                }
                Ok(Value::Object(out))
            }
            (Self::List(_), _) => Err(format!("expected LIST but got {value}")),
            (Self::Map(_) | Self::Object(_), _) => Err(format!("expected OBJECT but got {value}")),
        }
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// Validates a coerced, defined value.
pub trait ParameterValidator: Send + Sync {
    fn validate(&self, name: &str, value: &Value) -> Result<()>;
}

impl<F> ParameterValidator for F
where
    F: Fn(&str, &Value) -> Result<()> + Send + Sync,
{
    fn validate(&self, name: &str, value: &Value) -> Result<()> {
        self(name, value)
    }
}

/// Rewrites an incoming value given the currently stored one.
pub trait ValueCorrector: Send + Sync {
    fn correct(&self, new_value: Value, current: &Value) -> Value;
}

impl<F> ValueCorrector for F
where
    F: Fn(Value, &Value) -> Value + Send + Sync,
{
    fn correct(&self, new_value: Value, current: &Value) -> Value {
        self(new_value, current)
    }
}

/// Decides whether and how a stored value is written to persistent form.
pub trait AttributeMarshaller: Send + Sync {
    /// A value is marshallable when defined and, unless `marshal_default`
    /// is set, different from the attribute default.
    fn is_marshallable(
        &self,
        attribute: &AttributeDefinition,
        model: &Map<String, Value>,
        marshal_default: bool,
    ) -> bool {
        match model.get(attribute.name()).filter(|v| !v.is_null()) {
            Some(value) => marshal_default || attribute.default_value() != Some(value),
            None => false,
        }
    }

    fn marshal(&self, attribute: &AttributeDefinition, value: &Value) -> Option<String>;
}

/// Scalars as plain text, lists space-separated, objects as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAttributeMarshaller;

impl AttributeMarshaller for DefaultAttributeMarshaller {
    fn marshal(&self, _attribute: &AttributeDefinition, value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            other => Some(other.to_string()),
        }
    }
}

/// Inclusive integer bounds.
#[derive(Debug, Clone, Copy)]
pub struct RangeValidator {
    pub min: i64,
    pub max: i64,
}

impl ParameterValidator for RangeValidator {
    fn validate(&self, name: &str, value: &Value) -> Result<()> {
        match value.as_i64() {
            Some(n) if (self.min..=self.max).contains(&n) => Ok(()),
            _ => Err(ControllerError::InvalidAttribute {
                attribute: name.to_string(),
                reason: format!("{value} is outside the range {}..={}", self.min, self.max),
            }),
        }
    }
}

/// Accepts only the listed values.
#[derive(Debug, Clone)]
pub struct AllowedValuesValidator {
    pub allowed: Vec<Value>,
}

impl ParameterValidator for AllowedValuesValidator {
    fn validate(&self, name: &str, value: &Value) -> Result<()> {
        if self.allowed.contains(value) {
            return Ok(());
        }
        Err(ControllerError::InvalidAttribute {
            attribute: name.to_string(),
            reason: format!("{value} is not one of {:?}", self.allowed),
        })
    }
}

/// Attribute behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeFlag {
    /// Changing the value takes effect only after a reload
    RestartAllServices,
    /// Changing the value takes effect only after a full process restart
    RestartJvm,
    /// Changing the value restarts the services of this resource
    RestartResourceServices,
    /// Value lives in the runtime, not the persistent model
    StorageRuntime,
}

// ============================================================================
// AttributeDefinition
// ============================================================================

/// Immutable descriptor of one attribute.
#[derive(Clone)]
pub struct AttributeDefinition {
    name: String,
    xml_name: String,
    kind: AttributeKind,
    nullable: bool,
    allow_expression: bool,
    default: Option<Value>,
    validator: Option<Arc<dyn ParameterValidator>>,
    corrector: Option<Arc<dyn ValueCorrector>>,
    marshaller: Arc<dyn AttributeMarshaller>,
    flags: Vec<AttributeFlag>,
    alternatives: Vec<String>,
    requires: Vec<String>,
}

impl AttributeDefinition {
    pub fn builder(name: impl Into<String>, kind: AttributeKind) -> AttributeBuilder {
        let name = name.into();
        AttributeBuilder {
            definition: Self {
                xml_name: name.clone(),
                name,
                kind,
                nullable: false,
                allow_expression: false,
                default: None,
                validator: None,
                corrector: None,
                marshaller: Arc::new(DefaultAttributeMarshaller),
                flags: Vec::new(),
                alternatives: Vec::new(),
                requires: Vec::new(),
            },
        }
    }

    /// Shorthand for a single primitive attribute.
    pub fn simple(name: impl Into<String>, value_type: ValueType) -> AttributeBuilder {
        Self::builder(name, AttributeKind::Simple(value_type))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn xml_name(&self) -> &str {
        &self.xml_name
    }

    pub fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn allows_expression(&self) -> bool {
        self.allow_expression
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn alternatives(&self) -> &[String] {
        &self.alternatives
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    pub fn has_flag(&self, flag: AttributeFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Required when not nullable and no alternative exists.
    pub fn is_required(&self) -> bool {
        !self.nullable && self.alternatives.is_empty()
    }

    /// Allowed unless an alternative is defined.
    pub fn is_allowed(&self, defined: impl Fn(&str) -> bool) -> bool {
        !self.alternatives.iter().any(|alt| defined(alt))
    }

    /// Apply the corrector, if any.
    pub fn correct(&self, new_value: Value, current: &Value) -> Value {
        match &self.corrector {
            Some(corrector) => corrector.correct(new_value, current),
            None => new_value,
        }
    }

    /// Parse a textual value into this attribute's type.
    pub fn parse(&self, text: &str) -> Result<Value> {
        let raw = Value::String(text.to_string());
        if self.allow_expression && is_expression(&raw) {
            return Ok(raw);
        }
        self.coerce_defined(&raw)
    }

    /// Check a defined value: expression policy, type, then validator.
    pub fn validate_value(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if is_expression(value) {
            if self.allow_expression {
                return Ok(value.clone());
            }
            return Err(self.invalid("expressions are not allowed"));
        }
        self.coerce_defined(value)
    }

    fn coerce_defined(&self, value: &Value) -> Result<Value> {
        let coerced = self.kind.coerce(value).map_err(|reason| self.invalid(reason))?;
        if let Some(validator) = &self.validator {
            validator.validate(&self.name, &coerced)?;
        }
        Ok(coerced)
    }

    /// Nullability, alternatives and requires, judged against whatever
    /// attributes `defined` reports.
    fn check_constraints(&self, value: &Value, defined: impl Fn(&str) -> bool) -> Result<()> {
        if value.is_null() {
            let has_alternative = self.alternatives.iter().any(|alt| defined(alt));
            if !self.nullable && !has_alternative && self.default.is_none() {
                return Err(ControllerError::MissingRequired {
                    attribute: self.name.clone(),
                });
            }
            return Ok(());
        }
        if let Some(conflicting) = self.alternatives.iter().find(|alt| defined(alt)) {
            return Err(ControllerError::AlternativeConflict {
                attribute: self.name.clone(),
                conflicting: conflicting.clone(),
            });
        }
        if let Some(required) = self.requires.iter().find(|req| !defined(req)) {
            return Err(ControllerError::RequiresMissing {
                attribute: self.name.clone(),
                required: required.clone(),
            });
        }
        Ok(())
    }

    /// Validate a value with no sibling context, as for nested object fields.
    fn validate_standalone(&self, value: &Value) -> Result<Value> {
        self.check_constraints(value, |_| false)?;
        self.validate_value(value)
    }

    /// Validate the operation parameter named after this attribute.
    pub fn validate_operation(&self, operation: &Operation) -> Result<()> {
        let value = operation.get(&self.name).cloned().unwrap_or(Value::Null);
        self.check_constraints(&value, |name| operation.get(name).is_some())?;
        match (&value, &self.default) {
            (Value::Null, Some(default)) => self.validate_value(default).map(drop),
            _ => self.validate_value(&value).map(drop),
        }
    }

    /// Correct, validate and store the operation parameter into `model`.
    pub fn validate_and_set(&self, operation: &Operation, model: &mut Map<String, Value>) -> Result<()> {
        let raw = operation.get(&self.name).cloned().unwrap_or(Value::Null);
        let current = model.get(&self.name).cloned().unwrap_or(Value::Null);
        let corrected = self.correct(raw, &current);
        self.check_constraints(&corrected, |name| operation.get(name).is_some())?;
        if corrected.is_null()
            && let Some(default) = &self.default
        {
            self.validate_value(default)?;
        }
        let stored = self.validate_value(&corrected)?;
        store(model, &self.name, stored);
        Ok(())
    }

    /// Correct, validate and store `value`, checking constraints against the
    /// other attributes already in `model`. Returns the previous value.
    pub fn write_value(&self, value: Value, model: &mut Map<String, Value>) -> Result<Value> {
        let current = model.get(&self.name).cloned().unwrap_or(Value::Null);
        let corrected = self.correct(value, &current);
        self.check_constraints(&corrected, |name| {
            model.get(name).is_some_and(|v| !v.is_null())
        })?;
        let stored = self.validate_value(&corrected)?;
        store(model, &self.name, stored);
        Ok(current)
    }

    /// Stored value, or the default, with expressions resolved and the
    /// result validated.
    pub fn resolve_model_attribute(
        &self,
        resolver: &dyn ExpressionResolver,
        model: &Map<String, Value>,
    ) -> Result<Value> {
        let value = model
            .get(&self.name)
            .filter(|v| !v.is_null())
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or(Value::Null);
        self.resolve_value(resolver, &value)
    }

    pub fn resolve_value(&self, resolver: &dyn ExpressionResolver, value: &Value) -> Result<Value> {
        if value.is_null() {
            if self.is_required() {
                return Err(ControllerError::MissingRequired {
                    attribute: self.name.clone(),
                });
            }
            return Ok(Value::Null);
        }
        let resolved = resolver.resolve(value)?;
        self.coerce_defined(&resolved)
    }

    pub fn is_marshallable(&self, model: &Map<String, Value>, marshal_default: bool) -> bool {
        self.marshaller.is_marshallable(self, model, marshal_default)
    }

    /// `(xml_name, text)` for the stored value, when marshallable.
    pub fn marshal(&self, model: &Map<String, Value>, marshal_default: bool) -> Option<(String, String)> {
        if !self.is_marshallable(model, marshal_default) {
            return None;
        }
        let value = model.get(&self.name)?;
        self.marshaller
            .marshal(self, value)
            .map(|text| (self.xml_name.clone(), text))
    }

    fn invalid(&self, reason: impl Into<String>) -> ControllerError {
        ControllerError::InvalidAttribute {
            attribute: self.name.clone(),
            reason: reason.into(),
        }
    }
}

fn store(model: &mut Map<String, Value>, name: &str, value: Value) {
    if value.is_null() {
        model.remove(name);
    } else {
        model.insert(name.to_string(), value);
    }
}

impl fmt::Debug for AttributeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .field("allow_expression", &self.allow_expression)
            .field("default", &self.default)
            .field("flags", &self.flags)
            .field("alternatives", &self.alternatives)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AttributeDefinition`].
pub struct AttributeBuilder {
    definition: AttributeDefinition,
}

impl AttributeBuilder {
    pub fn xml_name(mut self, xml_name: impl Into<String>) -> Self {
        self.definition.xml_name = xml_name.into();
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.definition.nullable = nullable;
        self
    }

    pub fn allow_expression(mut self, allow: bool) -> Self {
        self.definition.allow_expression = allow;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.definition.default = Some(value.into());
        self
    }

    pub fn validator(mut self, validator: impl ParameterValidator + 'static) -> Self {
        self.definition.validator = Some(Arc::new(validator));
        self
    }

    pub fn corrector(mut self, corrector: impl ValueCorrector + 'static) -> Self {
        self.definition.corrector = Some(Arc::new(corrector));
        self
    }

    pub fn marshaller(mut self, marshaller: impl AttributeMarshaller + 'static) -> Self {
        self.definition.marshaller = Arc::new(marshaller);
        self
    }

    pub fn flag(mut self, flag: AttributeFlag) -> Self {
        if !self.definition.flags.contains(&flag) {
            self.definition.flags.push(flag);
        }
        self
    }

    pub fn alternatives(mut self, names: &[&str]) -> Self {
        self.definition.alternatives = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    pub fn requires(mut self, names: &[&str]) -> Self {
        self.definition.requires = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    pub fn build(self) -> AttributeDefinition {
        self.definition
    }
}

// ============================================================================
// ResourceDefinition
// ============================================================================

/// The attribute set of one resource type.
#[derive(Debug, Clone, Default)]
pub struct ResourceDefinition {
    attributes: Vec<AttributeDefinition>,
}

impl ResourceDefinition {
    pub fn new(attributes: Vec<AttributeDefinition>) -> Self {
        Self { attributes }
    }

    pub fn attributes(&self) -> &[AttributeDefinition] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Validate every operation parameter and populate `model`.
    ///
    /// Parameters that match no attribute are rejected.
    pub fn populate(&self, operation: &Operation, model: &mut Map<String, Value>) -> Result<()> {
        if let Some(unknown) = operation
            .params
            .keys()
            .find(|name| self.attribute(name).is_none())
        {
            return Err(ControllerError::UnknownAttribute {
                attribute: unknown.clone(),
                address: operation.address.clone(),
            });
        }
        for attribute in &self.attributes {
            attribute.validate_and_set(operation, model)?;
        }
        Ok(())
    }

    /// Write one attribute, then re-check the alternatives and requires of
    /// every attribute against the result. Returns the previous value and
    /// leaves `model` untouched on failure.
    pub fn write_value(
        &self,
        attribute: &AttributeDefinition,
        value: Value,
        model: &mut Map<String, Value>,
    ) -> Result<Value> {
        let mut candidate = model.clone();
        let old = attribute.write_value(value, &mut candidate)?;
        self.validate_model(&candidate)?;
        *model = candidate;
        Ok(old)
    }

    /// Check every attribute's constraints against a stored model.
    pub fn validate_model(&self, model: &Map<String, Value>) -> Result<()> {
        let defined = |name: &str| model.get(name).is_some_and(|v| !v.is_null());
        for attribute in &self.attributes {
            let value = model.get(attribute.name()).cloned().unwrap_or(Value::Null);
            attribute.check_constraints(&value, defined)?;
        }
        Ok(())
    }

    /// `model` with defaults filled in for undefined attributes.
    pub fn with_defaults(&self, model: &Map<String, Value>) -> Map<String, Value> {
        let mut out = model.clone();
        for attribute in &self.attributes {
            if let Some(default) = attribute.default_value() {
                let slot = out.entry(attribute.name().to_string()).or_insert(Value::Null);
                if slot.is_null() {
                    *slot = default.clone();
                }
            }
        }
        out
    }

    /// Marshal every marshallable attribute in definition order.
    pub fn marshal(&self, model: &Map<String, Value>, marshal_default: bool) -> Vec<(String, String)> {
        self.attributes
            .iter()
            .filter_map(|a| a.marshal(model, marshal_default))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::PropertyExpressionResolver;
    use pathaddr::PathAddress;
    use serde_json::json;

    fn op() -> Operation {
        Operation::new("add", "/subsystem=foo".parse::<PathAddress>().unwrap())
    }

    #[test]
    fn test_required_attribute_missing() {
        let attr = AttributeDefinition::simple("value", ValueType::Int).build();
        let err = attr.validate_operation(&op()).unwrap_err();
        assert!(matches!(err, ControllerError::MissingRequired { ref attribute } if attribute == "value"));
        assert!(attr.is_required());
    }

    #[test]
    fn test_resource_write_rechecks_siblings() {
        let definition = ResourceDefinition::new(vec![
            AttributeDefinition::simple("a", ValueType::Int).nullable(true).build(),
            AttributeDefinition::simple("b", ValueType::Int)
                .nullable(true)
                .requires(&["a"])
                .build(),
        ]);
        let mut model = Map::new();
        model.insert("a".to_string(), json!(1));
        model.insert("b".to_string(), json!(2));
        let a = definition.attribute("a").unwrap().clone();

        let err = definition.write_value(&a, Value::Null, &mut model).unwrap_err();
        assert!(matches!(err, ControllerError::RequiresMissing { ref required, .. } if required == "a"));
        assert_eq!(model.get("a"), Some(&json!(1)));

        let old = definition.write_value(&a, json!(5), &mut model).unwrap();
        assert_eq!(old, json!(1));
        assert_eq!(model.get("a"), Some(&json!(5)));
    }

    #[test]
    fn test_default_satisfies_required() {
        let attr = AttributeDefinition::simple("port", ValueType::Int)
            .default_value(8080)
            .build();
        assert!(attr.validate_operation(&op()).is_ok());

        let mut model = Map::new();
        attr.validate_and_set(&op(), &mut model).unwrap();
        assert!(model.get("port").is_none());
        assert_eq!(ResourceDefinition::new(vec![attr]).with_defaults(&model)["port"], 8080);
    }

    #[test]
    fn test_type_coercion() {
        let attr = AttributeDefinition::simple("port", ValueType::Int).build();
        let mut model = Map::new();
        attr.validate_and_set(&op().param("port", "8080"), &mut model).unwrap();
        assert_eq!(model["port"], json!(8080));

        let err = attr.validate_operation(&op().param("port", "eighty")).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidAttribute { .. }));
        assert!(attr.validate_operation(&op().param("port", 1_i64 << 40)).is_err());

        let flag = AttributeDefinition::simple("enabled", ValueType::Boolean).build();
        assert_eq!(flag.parse("TRUE").unwrap(), json!(true));
        let text = AttributeDefinition::simple("label", ValueType::String).build();
        assert_eq!(text.validate_value(&json!(12)).unwrap(), json!("12"));
    }

    #[test]
    fn test_validator_and_corrector() {
        let attr = AttributeDefinition::simple("level", ValueType::String)
            .corrector(|new: Value, _current: &Value| match new {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            })
            .validator(AllowedValuesValidator {
                allowed: vec![json!("INFO"), json!("DEBUG")],
            })
            .build();

        let mut model = Map::new();
        attr.validate_and_set(&op().param("level", "debug"), &mut model).unwrap();
        assert_eq!(model["level"], "DEBUG");
        assert!(attr.validate_and_set(&op().param("level", "trace"), &mut model).is_err());
    }

    #[test]
    fn test_range_validator() {
        let attr = AttributeDefinition::simple("threads", ValueType::Int)
            .validator(RangeValidator { min: 1, max: 64 })
            .build();
        assert!(attr.validate_value(&json!(8)).is_ok());
        assert!(attr.validate_value(&json!(0)).is_err());
    }

    #[test]
    fn test_alternatives_and_requires() {
        let path = AttributeDefinition::simple("path", ValueType::String)
            .alternatives(&["url"])
            .requires(&["relative-to"])
            .build();
        let conflict = op().param("path", "a").param("url", "b").param("relative-to", "x");
        assert!(matches!(
            path.validate_operation(&conflict),
            Err(ControllerError::AlternativeConflict { .. })
        ));
        assert!(matches!(
            path.validate_operation(&op().param("path", "a")),
            Err(ControllerError::RequiresMissing { .. })
        ));

        // Undefined is fine once the alternative is present.
        assert!(path.validate_operation(&op().param("url", "b")).is_ok());
        assert!(!path.is_allowed(|name| name == "url"));
        assert!(!path.is_required());
    }

    #[test]
    fn test_expressions() {
        let attr = AttributeDefinition::simple("port", ValueType::Int)
            .allow_expression(true)
            .build();
        let mut model = Map::new();
        attr.validate_and_set(&op().param("port", "${port:9990}"), &mut model).unwrap();
        assert_eq!(model["port"], "${port:9990}");

        let resolver = PropertyExpressionResolver::new();
        assert_eq!(attr.resolve_model_attribute(&resolver, &model).unwrap(), json!(9990));

        let strict = AttributeDefinition::simple("port", ValueType::Int).build();
        assert!(strict.validate_value(&json!("${port}")).is_err());
    }

    #[test]
    fn test_list_map_object_kinds() {
        let list = AttributeDefinition::builder("ports", AttributeKind::List(ValueType::Int)).build();
        assert_eq!(list.validate_value(&json!(["1", 2])).unwrap(), json!([1, 2]));
        assert!(list.validate_value(&json!(1)).is_err());

        let map = AttributeDefinition::builder("props", AttributeKind::Map(ValueType::String)).build();
        assert_eq!(map.validate_value(&json!({"a": 1})).unwrap(), json!({"a": "1"}));

        let object = AttributeDefinition::builder(
            "socket",
            AttributeKind::Object(vec![
                AttributeDefinition::simple("host", ValueType::String).build(),
                AttributeDefinition::simple("port", ValueType::Int).nullable(true).build(),
            ]),
        )
        .build();
        assert_eq!(
            object.validate_value(&json!({"host": "localhost"})).unwrap(),
            json!({"host": "localhost"})
        );
        assert!(object.validate_value(&json!({"port": 1})).is_err());
        assert!(object.validate_value(&json!({"host": "h", "extra": 1})).is_err());
    }

    #[test]
    fn test_write_value_returns_previous() {
        let attr = AttributeDefinition::simple("value", ValueType::Int).build();
        let mut model = Map::new();
        model.insert("value".to_string(), json!(1));
        let old = attr.write_value(json!(2), &mut model).unwrap();
        assert_eq!(old, json!(1));
        assert_eq!(model["value"], 2);
        assert!(attr.write_value(Value::Null, &mut model).is_err());
    }

    #[test]
    fn test_marshalling_skips_defaults() {
        let attr = AttributeDefinition::simple("port", ValueType::Int)
            .xml_name("port-number")
            .default_value(8080)
            .build();
        let mut model = Map::new();
        model.insert("port".to_string(), json!(8080));
        assert_eq!(attr.marshal(&model, false), None);
        assert_eq!(
            attr.marshal(&model, true),
            Some(("port-number".to_string(), "8080".to_string()))
        );

        let list = AttributeDefinition::builder("names", AttributeKind::List(ValueType::String)).build();
        let mut model = Map::new();
        model.insert("names".to_string(), json!(["a", "b"]));
        assert_eq!(list.marshal(&model, false).map(|(_, t)| t), Some("a b".to_string()));
    }

    #[test]
    fn test_resource_definition_rejects_unknown_params() {
        let definition = ResourceDefinition::new(vec![
            AttributeDefinition::simple("value", ValueType::Int).build(),
        ]);
        let mut model = Map::new();
        let err = definition
            .populate(&op().param("value", 1).param("bogus", 2), &mut model)
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownAttribute { .. }));
        definition.populate(&op().param("value", 1), &mut model).unwrap();
        assert_eq!(definition.marshal(&model, false), vec![("value".to_string(), "1".to_string())]);
    }
}

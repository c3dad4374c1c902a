//! The hierarchical resource tree.
//!
//! Each node holds an attribute map and child resources grouped by child
//! type and then child name. Cloning a resource is a deep copy, which is
//! how an operation gets its private working tree.

use crate::error::{ControllerError, Result};
use pathaddr::{PathAddress, PathElement};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A node in the model tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    model: Map<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, BTreeMap<String, Resource>>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Map<String, Value>) -> Self {
        Self {
            model,
            children: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &Map<String, Value> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.model
    }

    pub fn set_model(&mut self, model: Map<String, Value>) {
        self.model = model;
    }

    /// A defined (non-null) attribute value.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.model.get(name).filter(|v| !v.is_null())
    }

    pub fn has_child(&self, element: &PathElement) -> bool {
        self.child(element).is_some()
    }

    pub fn child(&self, element: &PathElement) -> Option<&Resource> {
        self.children
            .get(element.key())
            .and_then(|named| named.get(element.value()))
    }

    pub fn child_mut(&mut self, element: &PathElement) -> Option<&mut Resource> {
        self.children
            .get_mut(element.key())
            .and_then(|named| named.get_mut(element.value()))
    }

    pub fn require_child(&self, element: &PathElement) -> Result<&Resource> {
        self.child(element)
            .ok_or_else(|| ControllerError::ResourceNotFound {
                address: PathAddress::new([element.clone()]).unwrap_or_default(),
            })
    }

    /// Children of one type, ordered by name.
    pub fn get_children(&self, child_type: &str) -> impl Iterator<Item = (&str, &Resource)> {
        self.children
            .get(child_type)
            .into_iter()
            .flat_map(|named| named.iter().map(|(name, r)| (name.as_str(), r)))
    }

    pub fn child_names(&self, child_type: &str) -> Vec<String> {
        self.get_children(child_type)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Child types that currently have at least one child.
    pub fn child_types(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|(_, named)| !named.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Insert a child, returning any resource it replaced.
    pub fn register_child(&mut self, element: &PathElement, child: Resource) -> Option<Resource> {
        self.children
            .entry(element.key().to_string())
            .or_default()
            .insert(element.value().to_string(), child)
    }

    pub fn remove_child(&mut self, element: &PathElement) -> Option<Resource> {
        let named = self.children.get_mut(element.key())?;
        let removed = named.remove(element.value());
        if named.is_empty() {
            self.children.remove(element.key());
        }
        removed
    }

    pub fn navigate(&self, address: &PathAddress) -> Result<&Resource> {
        let mut current = self;
        for element in address {
            reject_wildcard(element, address)?;
            current = current
                .child(element)
                .ok_or_else(|| ControllerError::ResourceNotFound {
                    address: address.clone(),
                })?;
        }
        Ok(current)
    }

    pub fn navigate_mut(&mut self, address: &PathAddress) -> Result<&mut Resource> {
        let mut current = self;
        for element in address {
            reject_wildcard(element, address)?;
            current = current
                .child_mut(element)
                .ok_or_else(|| ControllerError::ResourceNotFound {
                    address: address.clone(),
                })?;
        }
        Ok(current)
    }

    /// Walk to `address`, creating empty resources along the way.
    pub fn navigate_or_create(&mut self, address: &PathAddress) -> Result<&mut Resource> {
        let mut current = self;
        for element in address {
            reject_wildcard(element, address)?;
            current = current
                .children
                .entry(element.key().to_string())
                .or_default()
                .entry(element.value().to_string())
                .or_default();
        }
        Ok(current)
    }

    pub fn contains(&self, address: &PathAddress) -> bool {
        self.navigate(address).is_ok()
    }

    /// Remove the resource at `address` with all its descendants.
    pub fn remove(&mut self, address: &PathAddress) -> Result<Resource> {
        let Some(last) = address.last_element() else {
            return Err(ControllerError::InvalidOperation(
                "the root resource cannot be removed".to_string(),
            ));
        };
        let parent = self.navigate_mut(&address.parent())?;
        parent
            .remove_child(last)
            .ok_or_else(|| ControllerError::ResourceNotFound {
                address: address.clone(),
            })
    }

    /// Render attributes and children as JSON.
    ///
    /// Without `recursive`, child entries are listed with undefined values.
    pub fn to_value(&self, recursive: bool) -> Value {
        let mut out = self.model.clone();
        for (child_type, named) in &self.children {
            let entries: Map<String, Value> = named
                .iter()
                .map(|(name, child)| {
                    let rendered = if recursive {
                        child.to_value(true)
                    } else {
                        Value::Null
                    };
                    (name.clone(), rendered)
                })
                .collect();
            out.insert(child_type.clone(), Value::Object(entries));
        }
        Value::Object(out)
    }

    /// Concrete addresses of existing resources matching a wildcard pattern.
    pub fn matching_addresses(&self, pattern: &PathAddress) -> Vec<PathAddress> {
        let mut out = Vec::new();
        self.collect_matching(pattern.elements(), &PathAddress::EMPTY, &mut out);
        out
    }

    fn collect_matching(&self, remaining: &[PathElement], base: &PathAddress, out: &mut Vec<PathAddress>) {
        let Some((first, rest)) = remaining.split_first() else {
            out.push(base.clone());
            return;
        };
        let Some(named) = self.children.get(first.key()) else {
            return;
        };
        for (name, child) in named {
            if !first.is_wildcard() && first.value() != name {
                continue;
            }
            let Ok(element) = PathElement::new(first.key(), name.as_str()) else {
                continue;
            };
            child.collect_matching(rest, &base.append_element(element), out);
        }
    }

    /// Addresses of every descendant, parents before children.
    pub fn descendant_addresses(&self) -> Vec<PathAddress> {
        let mut out = Vec::new();
        self.collect_addresses(&PathAddress::EMPTY, &mut out);
        out
    }

    fn collect_addresses(&self, base: &PathAddress, out: &mut Vec<PathAddress>) {
        for (child_type, named) in &self.children {
            for (name, child) in named {
                let Ok(element) = PathElement::new(child_type.as_str(), name.as_str()) else {
                    continue;
                };
                let address = base.append_element(element);
                out.push(address.clone());
                child.collect_addresses(&address, out);
            }
        }
    }
}

fn reject_wildcard(element: &PathElement, address: &PathAddress) -> Result<()> {
    if element.is_wildcard() {
        return Err(ControllerError::WildcardNavigation {
            address: address.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> PathAddress {
        s.parse().unwrap()
    }

    fn sample() -> Resource {
        let mut root = Resource::new();
        root.navigate_or_create(&addr("/subsystem=logging/handler=console"))
            .unwrap()
            .model_mut()
            .insert("level".to_string(), json!("INFO"));
        root.navigate_or_create(&addr("/subsystem=web")).unwrap();
        root
    }

    #[test]
    fn test_navigate_existing_and_missing() {
        let root = sample();
        let handler = root.navigate(&addr("/subsystem=logging/handler=console")).unwrap();
        assert_eq!(handler.attribute("level"), Some(&json!("INFO")));

        let err = root.navigate(&addr("/subsystem=missing")).unwrap_err();
        assert!(matches!(err, ControllerError::ResourceNotFound { .. }));
    }

    #[test]
    fn test_wildcard_navigation_is_structural_error() {
        let root = sample();
        let err = root.navigate(&addr("/subsystem=*")).unwrap_err();
        assert!(matches!(err, ControllerError::WildcardNavigation { .. }));
        assert_eq!(err.category(), crate::error::ErrorCategory::Server);
    }

    #[test]
    fn test_children_and_types() {
        let root = sample();
        assert_eq!(root.child_types(), vec!["subsystem"]);
        assert_eq!(root.child_names("subsystem"), vec!["logging", "web"]);
        assert!(root.child_names("interface").is_empty());
        let element = PathElement::new("subsystem", "web").unwrap();
        assert!(root.has_child(&element));
        assert!(root.require_child(&element).is_ok());
    }

    #[test]
    fn test_remove_subtree() {
        let mut root = sample();
        let removed = root.remove(&addr("/subsystem=logging")).unwrap();
        assert!(removed.has_child(&PathElement::new("handler", "console").unwrap()));
        assert!(!root.contains(&addr("/subsystem=logging/handler=console")));
        assert!(root.remove(&addr("/subsystem=logging")).is_err());
        assert!(root.remove(&PathAddress::EMPTY).is_err());
    }

    #[test]
    fn test_clone_is_deep() {
        let original = sample();
        let mut copy = original.clone();
        copy.navigate_mut(&addr("/subsystem=logging/handler=console"))
            .unwrap()
            .model_mut()
            .insert("level".to_string(), json!("DEBUG"));
        assert_ne!(original, copy);
        assert_eq!(
            original
                .navigate(&addr("/subsystem=logging/handler=console"))
                .unwrap()
                .attribute("level"),
            Some(&json!("INFO"))
        );
    }

    #[test]
    fn test_to_value() {
        let root = sample();
        assert_eq!(
            root.to_value(false),
            json!({"subsystem": {"logging": null, "web": null}})
        );
        assert_eq!(
            root.to_value(true),
            json!({"subsystem": {"logging": {"handler": {"console": {"level": "INFO"}}}, "web": {}}})
        );
    }

    #[test]
    fn test_descendant_addresses_parent_first() {
        let root = sample();
        let addresses: Vec<String> = root
            .descendant_addresses()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            addresses,
            vec![
                "/subsystem=logging",
                "/subsystem=logging/handler=console",
                "/subsystem=web"
            ]
        );
    }

    #[test]
    fn test_matching_addresses() {
        let root = sample();
        let all: Vec<String> = root
            .matching_addresses(&addr("/subsystem=*"))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(all, vec!["/subsystem=logging", "/subsystem=web"]);

        let handlers = root.matching_addresses(&addr("/subsystem=*/handler=*"));
        assert_eq!(handlers, vec![addr("/subsystem=logging/handler=console")]);
        assert!(root.matching_addresses(&addr("/interface=*")).is_empty());
    }
}

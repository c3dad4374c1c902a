//! Handler registry keyed by address pattern and operation name.
//!
//! The registry is a tree of registration nodes, one per path element of
//! a registered pattern (`subsystem=*`, `subsystem=web`, ...). Each node
//! publishes an immutable snapshot of its state through an [`ArcSwap`];
//! lookups load snapshots without locking and writers replace them with a
//! compare-and-swap loop, so registration may race with lookups from
//! in-flight operations.
//!
//! Lookup prefers an exact element over a wildcard at every level. When the
//! exact branch has no handler for the operation, lookup backs up and tries
//! the wildcard branch. Operations registered as *inherited* at a node are
//! available on every descendant that has no registration of its own.

use crate::access::Effect;
use crate::attribute::ResourceDefinition;
use crate::context::OperationStepHandler;
use crate::error::{ControllerError, Result};
use arc_swap::ArcSwap;
use log::debug;
use pathaddr::{PathAddress, PathCursor, PathElement, WILDCARD_VALUE};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

/// Descriptive flags attached to an operation registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationFlags {
    /// The operation never modifies the model or runtime
    pub read_only: bool,
    /// The operation touches only the runtime, never the model
    pub runtime_only: bool,
}

impl OperationFlags {
    pub const READ_ONLY: Self = Self {
        read_only: true,
        runtime_only: false,
    };

    pub const NONE: Self = Self {
        read_only: false,
        runtime_only: false,
    };

    /// Effects an authorizer is asked about for an operation with these flags.
    pub fn effects(&self) -> Vec<Effect> {
        match (self.read_only, self.runtime_only) {
            (true, true) => vec![Effect::ReadRuntime],
            (true, false) => vec![Effect::ReadConfig, Effect::ReadRuntime],
            (false, true) => vec![Effect::ReadRuntime, Effect::WriteRuntime],
            (false, false) => vec![
                Effect::ReadConfig,
                Effect::WriteConfig,
                Effect::ReadRuntime,
                Effect::WriteRuntime,
            ],
        }
    }
}

/// A registered handler with its flags.
#[derive(Clone)]
pub struct OperationEntry {
    handler: Arc<dyn OperationStepHandler>,
    flags: OperationFlags,
    inherited: bool,
}

impl OperationEntry {
    pub fn handler(&self) -> &Arc<dyn OperationStepHandler> {
        &self.handler
    }

    pub fn flags(&self) -> OperationFlags {
        self.flags
    }

    pub fn is_inherited(&self) -> bool {
        self.inherited
    }
}

impl fmt::Debug for OperationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEntry")
            .field("flags", &self.flags)
            .field("inherited", &self.inherited)
            .finish_non_exhaustive()
    }
}

type ChildKey = (String, String);

/// Immutable snapshot of one registration node.
#[derive(Clone, Default)]
struct NodeState {
    definition: Option<Arc<ResourceDefinition>>,
    /// Handles every operation at or below this node
    proxy: Option<OperationEntry>,
    operations: BTreeMap<String, OperationEntry>,
    children: BTreeMap<ChildKey, Arc<RegistrationNode>>,
}

#[derive(Default)]
struct RegistrationNode {
    state: ArcSwap<NodeState>,
}

impl RegistrationNode {
    /// Apply `change` with a compare-and-swap retry loop.
    ///
    /// `change` returns the replacement state, or `None` to leave the node
    /// untouched, together with a value handed back to the caller.
    fn update<T, E>(
        &self,
        mut change: impl FnMut(&NodeState) -> std::result::Result<(Option<NodeState>, T), E>,
    ) -> std::result::Result<T, E> {
        loop {
            let current = self.state.load_full();
            let (next, out) = change(&current)?;
            let Some(next) = next else {
                return Ok(out);
            };
            let previous = self.state.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return Ok(out);
            }
        }
    }

    fn child(&self, key: &ChildKey) -> Option<Arc<RegistrationNode>> {
        self.state.load().children.get(key).cloned()
    }

    fn child_or_create(&self, element: &PathElement) -> Arc<RegistrationNode> {
        let key = child_key(element);
        if let Some(existing) = self.child(&key) {
            return existing;
        }
        let created = self.update(|state| {
            if let Some(existing) = state.children.get(&key) {
                return Ok::<_, Infallible>((None, Arc::clone(existing)));
            }
            let child = Arc::new(RegistrationNode::default());
            let mut next = state.clone();
            next.children.insert(key.clone(), Arc::clone(&child));
            Ok((Some(next), child))
        });
        match created {
            Ok(child) => child,
            Err(never) => match never {},
        }
    }
}

fn child_key(element: &PathElement) -> ChildKey {
    (element.key().to_string(), element.value().to_string())
}

fn wildcard_key(element: &PathElement) -> ChildKey {
    (element.key().to_string(), WILDCARD_VALUE.to_string())
}

/// Registry of resource types and operation handlers.
pub struct OperationRegistry {
    root: Arc<RegistrationNode>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RegistrationNode::default()),
        }
    }

    fn node_or_create(&self, pattern: &PathAddress) -> Arc<RegistrationNode> {
        let mut node = Arc::clone(&self.root);
        for element in pattern {
            node = node.child_or_create(element);
        }
        node
    }

    /// Register the resource type at `pattern` with its attribute definitions.
    pub fn register_resource(&self, pattern: &PathAddress, definition: ResourceDefinition) -> Result<()> {
        let definition = Arc::new(definition);
        self.node_or_create(pattern).update(|state| {
            if state.definition.is_some() {
                return Err(ControllerError::DuplicateRegistration {
                    operation: "resource definition".to_string(),
                    address: pattern.clone(),
                });
            }
            let mut next = state.clone();
            next.definition = Some(Arc::clone(&definition));
            Ok((Some(next), ()))
        })?;
        debug!("Registered resource type {pattern}");
        Ok(())
    }

    /// Register a handler for `name` at `pattern`.
    ///
    /// Fails when a handler is already registered for the same pattern and
    /// name.
    pub fn register_operation(
        &self,
        pattern: &PathAddress,
        name: &str,
        handler: Arc<dyn OperationStepHandler>,
        flags: OperationFlags,
    ) -> Result<()> {
        self.insert_operation(pattern, name, handler, flags, false)
    }

    /// Register a handler that descendants of `pattern` inherit.
    pub fn register_inherited_operation(
        &self,
        pattern: &PathAddress,
        name: &str,
        handler: Arc<dyn OperationStepHandler>,
        flags: OperationFlags,
    ) -> Result<()> {
        self.insert_operation(pattern, name, handler, flags, true)
    }

    fn insert_operation(
        &self,
        pattern: &PathAddress,
        name: &str,
        handler: Arc<dyn OperationStepHandler>,
        flags: OperationFlags,
        inherited: bool,
    ) -> Result<()> {
        let entry = OperationEntry {
            handler,
            flags,
            inherited,
        };
        self.node_or_create(pattern).update(|state| {
            if state.operations.contains_key(name) {
                return Err(ControllerError::DuplicateRegistration {
                    operation: name.to_string(),
                    address: pattern.clone(),
                });
            }
            let mut next = state.clone();
            next.operations.insert(name.to_string(), entry.clone());
            Ok((Some(next), ()))
        })?;
        debug!("Registered operation '{name}' at {pattern}");
        Ok(())
    }

    /// Route every operation at or below `pattern` to `handler`.
    pub fn register_proxy(&self, pattern: &PathAddress, handler: Arc<dyn OperationStepHandler>) -> Result<()> {
        let entry = OperationEntry {
            handler,
            flags: OperationFlags::NONE,
            inherited: false,
        };
        self.node_or_create(pattern).update(|state| {
            if state.proxy.is_some() {
                return Err(ControllerError::DuplicateRegistration {
                    operation: "proxy".to_string(),
                    address: pattern.clone(),
                });
            }
            let mut next = state.clone();
            next.proxy = Some(entry.clone());
            Ok((Some(next), ()))
        })?;
        debug!("Registered proxy at {pattern}");
        Ok(())
    }

    /// Remove a handler registration; returns whether one existed.
    pub fn unregister_operation(&self, pattern: &PathAddress, name: &str) -> bool {
        let Some(node) = self.exact_node(pattern) else {
            return false;
        };
        let removed = node.update(|state| {
            if !state.operations.contains_key(name) {
                return Ok::<_, Infallible>((None, false));
            }
            let mut next = state.clone();
            next.operations.remove(name);
            Ok((Some(next), true))
        });
        matches!(removed, Ok(true))
    }

    /// The node registered for exactly `pattern`, wildcards matched literally.
    fn exact_node(&self, pattern: &PathAddress) -> Option<Arc<RegistrationNode>> {
        let mut node = Arc::clone(&self.root);
        for element in pattern {
            node = node.child(&child_key(element))?;
        }
        Some(node)
    }

    /// Resolve the node for a concrete or wildcard address.
    fn find_node(&self, address: &PathAddress) -> Option<Arc<RegistrationNode>> {
        fn walk(node: &Arc<RegistrationNode>, cursor: &mut PathCursor<'_>) -> Option<Arc<RegistrationNode>> {
            let Some(element) = cursor.next() else {
                return Some(Arc::clone(node));
            };
            if node.state.load().proxy.is_some() {
                return Some(Arc::clone(node));
            }
            let position = cursor.index();
            if !element.is_wildcard()
                && let Some(child) = node.child(&child_key(element))
                && let Some(found) = walk(&child, cursor)
            {
                return Some(found);
            }
            rewind(cursor, position);
            let child = node.child(&wildcard_key(element))?;
            walk(&child, cursor)
        }
        walk(&self.root, &mut address.cursor())
    }

    /// Find the entry for `name` at `address`.
    pub fn get_operation_entry(&self, address: &PathAddress, name: &str) -> Option<OperationEntry> {
        fn walk(
            node: &Arc<RegistrationNode>,
            cursor: &mut PathCursor<'_>,
            name: &str,
            inherited: Option<&OperationEntry>,
        ) -> Option<OperationEntry> {
            let state = node.state.load_full();
            if let Some(proxy) = &state.proxy {
                return Some(proxy.clone());
            }
            let own = state.operations.get(name);
            let inherited = own.filter(|e| e.inherited).or(inherited);

            let Some(element) = cursor.next() else {
                return own.or(inherited).cloned();
            };
            let position = cursor.index();
            if !element.is_wildcard()
                && let Some(child) = state.children.get(&child_key(element))
                && let Some(found) = walk(child, cursor, name, inherited)
            {
                return Some(found);
            }
            rewind(cursor, position);
            let child = state.children.get(&wildcard_key(element))?;
            walk(child, cursor, name, inherited)
        }
        walk(&self.root, &mut address.cursor(), name, None)
    }

    pub fn get_handler(&self, address: &PathAddress, name: &str) -> Option<Arc<dyn OperationStepHandler>> {
        self.get_operation_entry(address, name).map(|entry| entry.handler)
    }

    /// Whether a resource type is registered for `address`.
    pub fn is_registered(&self, address: &PathAddress) -> bool {
        self.find_node(address).is_some()
    }

    pub fn resource_definition(&self, address: &PathAddress) -> Option<Arc<ResourceDefinition>> {
        self.find_node(address)?.state.load().definition.clone()
    }

    /// Registered child types below `address`.
    pub fn child_types(&self, address: &PathAddress) -> Vec<String> {
        let Some(node) = self.find_node(address) else {
            return Vec::new();
        };
        let state = node.state.load();
        let types: BTreeSet<&str> = state.children.keys().map(|(key, _)| key.as_str()).collect();
        types.into_iter().map(str::to_string).collect()
    }

    /// Operations callable at `address`, including inherited ones.
    pub fn operation_names(&self, address: &PathAddress) -> Vec<String> {
        let mut names = BTreeSet::new();
        let mut cursor = address.cursor();
        let mut node = Arc::clone(&self.root);
        loop {
            let state = node.state.load_full();
            let last = !cursor.has_next();
            names.extend(
                state
                    .operations
                    .iter()
                    .filter(|(_, entry)| last || entry.inherited)
                    .map(|(name, _)| name.clone()),
            );
            let Some(element) = cursor.next() else {
                break;
            };
            let next = (!element.is_wildcard())
                .then(|| state.children.get(&child_key(element)))
                .flatten()
                .or_else(|| state.children.get(&wildcard_key(element)));
            match next {
                Some(child) => node = Arc::clone(child),
                None => return Vec::new(),
            }
        }
        names.into_iter().collect()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry").finish_non_exhaustive()
    }
}

fn rewind(cursor: &mut PathCursor<'_>, position: usize) {
    while cursor.index() > position {
        cursor.previous();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{OperationContext, handler_fn};
    use crate::operation::Operation;
    use std::thread;

    fn addr(s: &str) -> PathAddress {
        s.parse().unwrap()
    }

    fn marker(tag: &'static str) -> Arc<dyn OperationStepHandler> {
        handler_fn(move |ctx: &mut OperationContext, _op: &Operation| {
            *ctx.result_mut() = serde_json::json!(tag);
            ctx.step_completed();
            Ok(())
        })
    }

    fn same(a: &Arc<dyn OperationStepHandler>, b: &Arc<dyn OperationStepHandler>) -> bool {
        Arc::ptr_eq(a, b)
    }

    #[test]
    fn test_exact_match_preferred_over_wildcard() {
        let registry = OperationRegistry::new();
        let wildcard = marker("wildcard");
        let exact = marker("exact");
        registry
            .register_operation(&addr("/subsystem=*"), "start", Arc::clone(&wildcard), OperationFlags::NONE)
            .unwrap();
        registry
            .register_operation(&addr("/subsystem=web"), "start", Arc::clone(&exact), OperationFlags::NONE)
            .unwrap();

        let found = registry.get_handler(&addr("/subsystem=web"), "start").unwrap();
        assert!(same(&found, &exact));
        let found = registry.get_handler(&addr("/subsystem=logging"), "start").unwrap();
        assert!(same(&found, &wildcard));
    }

    #[test]
    fn test_falls_back_to_wildcard_when_exact_lacks_operation() {
        let registry = OperationRegistry::new();
        let wildcard = marker("wildcard");
        registry
            .register_operation(&addr("/subsystem=*/handler=*"), "enable", Arc::clone(&wildcard), OperationFlags::NONE)
            .unwrap();
        registry
            .register_operation(&addr("/subsystem=web"), "start", marker("exact"), OperationFlags::NONE)
            .unwrap();

        let found = registry
            .get_handler(&addr("/subsystem=web/handler=console"), "enable")
            .unwrap();
        assert!(same(&found, &wildcard));
    }

    #[test]
    fn test_inherited_operations() {
        let registry = OperationRegistry::new();
        let global = marker("global");
        registry
            .register_inherited_operation(&PathAddress::EMPTY, "read-resource", Arc::clone(&global), OperationFlags::READ_ONLY)
            .unwrap();
        registry
            .register_resource(&addr("/subsystem=*"), ResourceDefinition::default())
            .unwrap();

        let entry = registry
            .get_operation_entry(&addr("/subsystem=web"), "read-resource")
            .unwrap();
        assert!(entry.is_inherited());
        assert!(entry.flags().read_only);
        assert!(same(entry.handler(), &global));

        // Unregistered resource types inherit nothing.
        assert!(registry.get_handler(&addr("/interface=public"), "read-resource").is_none());
    }

    #[test]
    fn test_own_registration_overrides_inherited() {
        let registry = OperationRegistry::new();
        let local = marker("local");
        registry
            .register_inherited_operation(&PathAddress::EMPTY, "describe", marker("global"), OperationFlags::READ_ONLY)
            .unwrap();
        registry
            .register_operation(&addr("/subsystem=web"), "describe", Arc::clone(&local), OperationFlags::READ_ONLY)
            .unwrap();
        let found = registry.get_handler(&addr("/subsystem=web"), "describe").unwrap();
        assert!(same(&found, &local));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = OperationRegistry::new();
        let pattern = addr("/subsystem=*");
        registry
            .register_operation(&pattern, "add", marker("a"), OperationFlags::NONE)
            .unwrap();
        let err = registry
            .register_operation(&pattern, "add", marker("b"), OperationFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateRegistration { .. }));

        registry
            .register_resource(&pattern, ResourceDefinition::default())
            .unwrap();
        assert!(registry
            .register_resource(&pattern, ResourceDefinition::default())
            .is_err());
    }

    #[test]
    fn test_proxy_handles_subtree() {
        let registry = OperationRegistry::new();
        let proxy = marker("proxy");
        registry
            .register_proxy(&addr("/host=remote"), Arc::clone(&proxy))
            .unwrap();

        for (address, name) in [
            ("/host=remote", "read-resource"),
            ("/host=remote/subsystem=web", "add"),
        ] {
            let found = registry.get_handler(&addr(address), name).unwrap();
            assert!(same(&found, &proxy));
        }
        assert!(registry.is_registered(&addr("/host=remote/anything=here")));
        assert!(registry.register_proxy(&addr("/host=remote"), marker("again")).is_err());
    }

    #[test]
    fn test_unregister() {
        let registry = OperationRegistry::new();
        let pattern = addr("/subsystem=*");
        registry
            .register_operation(&pattern, "add", marker("a"), OperationFlags::NONE)
            .unwrap();
        assert!(registry.unregister_operation(&pattern, "add"));
        assert!(!registry.unregister_operation(&pattern, "add"));
        assert!(registry.get_handler(&addr("/subsystem=web"), "add").is_none());
    }

    #[test]
    fn test_registered_types_and_names() {
        let registry = OperationRegistry::new();
        registry
            .register_inherited_operation(&PathAddress::EMPTY, "read-resource", marker("r"), OperationFlags::READ_ONLY)
            .unwrap();
        registry
            .register_operation(&PathAddress::EMPTY, "shutdown", marker("s"), OperationFlags::NONE)
            .unwrap();
        registry
            .register_operation(&addr("/subsystem=*"), "add", marker("a"), OperationFlags::NONE)
            .unwrap();
        registry
            .register_resource(&addr("/interface=*"), ResourceDefinition::default())
            .unwrap();

        assert!(registry.is_registered(&addr("/subsystem=web")));
        assert!(registry.is_registered(&addr("/subsystem=*")));
        assert!(!registry.is_registered(&addr("/socket=http")));
        assert_eq!(registry.child_types(&PathAddress::EMPTY), vec!["interface", "subsystem"]);
        assert!(registry.resource_definition(&addr("/interface=public")).is_some());
        assert!(registry.resource_definition(&addr("/subsystem=web")).is_none());

        assert_eq!(
            registry.operation_names(&PathAddress::EMPTY),
            vec!["read-resource", "shutdown"]
        );
        assert_eq!(
            registry.operation_names(&addr("/subsystem=web")),
            vec!["add", "read-resource"]
        );
        assert!(registry.operation_names(&addr("/socket=http")).is_empty());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(OperationRegistry::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for j in 0..20 {
                        let pattern = addr(&format!("/subsystem=s{}", j % 4));
                        registry
                            .register_operation(&pattern, &format!("op-{i}-{j}"), marker("x"), OperationFlags::NONE)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let total: usize = (0..4)
            .map(|s| registry.operation_names(&addr(&format!("/subsystem=s{s}"))).len())
            .sum();
        assert_eq!(total, 160);
    }
}

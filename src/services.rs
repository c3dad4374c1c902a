//! Runtime service container interface.
//!
//! RUNTIME-stage handlers install and remove services; the VERIFY stage
//! polls their state until they settle. The container itself is an
//! external collaborator; [`InMemoryServiceContainer`] is a self-contained
//! implementation with dependency tracking and delayed starts.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Dotted service name, e.g. `subsystem.logging.handler.console`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn append(&self, part: &str) -> Self {
        Self(format!("{}.{part}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// What to install.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescriptor {
    /// Services that must be up before this one is
    pub dependencies: Vec<ServiceName>,
    /// Time the service spends starting after installation
    pub start_delay: Option<Duration>,
    /// When set, the service fails to start with this message
    pub start_failure: Option<String>,
    /// Opaque value exposed by the service
    pub value: Value,
}

impl ServiceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(mut self, name: impl Into<ServiceName>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }
}

/// Observable service state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Up,
    Failed(String),
}

impl ServiceState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Starting)
    }
}

/// Service lifecycle manager used by RUNTIME handlers.
pub trait ServiceContainer: Send + Sync {
    /// Install a service. Installing an existing name fails.
    fn install(&self, name: ServiceName, descriptor: ServiceDescriptor) -> Result<()>;

    /// Remove a service, returning its descriptor.
    fn remove(&self, name: &ServiceName) -> Option<ServiceDescriptor>;

    fn state(&self, name: &ServiceName) -> Option<ServiceState>;

    fn descriptor(&self, name: &ServiceName) -> Option<ServiceDescriptor>;

    fn names(&self) -> Vec<ServiceName>;
}

struct InstalledService {
    descriptor: ServiceDescriptor,
    installed_at: Instant,
}

/// In-process container; state is computed on demand from install time
/// and dependencies.
#[derive(Default)]
pub struct InMemoryServiceContainer {
    services: Mutex<BTreeMap<ServiceName, InstalledService>>,
}

impl InMemoryServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn services(&self) -> MutexGuard<'_, BTreeMap<ServiceName, InstalledService>> {
        match self.services.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn compute_state(
    services: &BTreeMap<ServiceName, InstalledService>,
    name: &ServiceName,
    visiting: &mut BTreeSet<ServiceName>,
) -> Option<ServiceState> {
    let service = services.get(name)?;
    if let Some(message) = &service.descriptor.start_failure {
        return Some(ServiceState::Failed(message.clone()));
    }
    if !visiting.insert(name.clone()) {
        return Some(ServiceState::Failed("circular dependency".to_string()));
    }

    let mut starting = service
        .descriptor
        .start_delay
        .is_some_and(|delay| service.installed_at.elapsed() < delay);

    for dependency in &service.descriptor.dependencies {
        match compute_state(services, dependency, visiting) {
            None => {
                visiting.remove(name);
                return Some(ServiceState::Failed(format!(
                    "missing dependency {dependency}"
                )));
            }
            Some(ServiceState::Failed(reason)) => {
                visiting.remove(name);
                return Some(ServiceState::Failed(format!(
                    "dependency {dependency} failed: {reason}"
                )));
            }
            Some(ServiceState::Starting) => starting = true,
            Some(ServiceState::Up) => {}
        }
    }

    visiting.remove(name);
    Some(if starting {
        ServiceState::Starting
    } else {
        ServiceState::Up
    })
}

impl ServiceContainer for InMemoryServiceContainer {
    fn install(&self, name: ServiceName, descriptor: ServiceDescriptor) -> Result<()> {
        let mut services = self.services();
        if services.contains_key(&name) {
            return Err(ControllerError::Service {
                name: name.to_string(),
                reason: "already installed".to_string(),
            });
        }
        log::debug!("Installing service {name}");
        services.insert(
            name,
            InstalledService {
                descriptor,
                installed_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn remove(&self, name: &ServiceName) -> Option<ServiceDescriptor> {
        let removed = self.services().remove(name).map(|s| s.descriptor);
        if removed.is_some() {
            log::debug!("Removed service {name}");
        }
        removed
    }

    fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        let services = self.services();
        compute_state(&services, name, &mut BTreeSet::new())
    }

    fn descriptor(&self, name: &ServiceName) -> Option<ServiceDescriptor> {
        self.services().get(name).map(|s| s.descriptor.clone())
    }

    fn names(&self) -> Vec<ServiceName> {
        self.services().keys().cloned().collect()
    }
}

//! Configuration persistence.
//!
//! `store` is called at commit preparation time when an operation changed
//! the model. It returns a transaction resource, so the write becomes
//! durable only if the controller transaction commits. `load` turns the
//! stored model back into the ordered `add` operations that rebuild it.

use crate::operation::{Operation, names};
use crate::resource::Resource;
use anyhow::{Context, Result};
use pathaddr::PathAddress;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use txkit::{CallbackResource, ControllerResource};

/// Stores the model and replays it at boot.
pub trait ConfigurationPersister: Send + Sync {
    /// Stage a write of `root`; commit makes it durable, rollback discards it.
    fn store(
        &self,
        root: &Resource,
        affected: &BTreeSet<PathAddress>,
    ) -> Result<Box<dyn ControllerResource>>;

    /// Operations that rebuild the stored model, parents first.
    fn load(&self) -> Result<Vec<Operation>>;
}

/// Persister that stores nothing.
pub struct NullPersister;

impl ConfigurationPersister for NullPersister {
    fn store(
        &self,
        _root: &Resource,
        _affected: &BTreeSet<PathAddress>,
    ) -> Result<Box<dyn ControllerResource>> {
        Ok(Box::new(CallbackResource::new(|| Ok(()), || Ok(()))))
    }

    fn load(&self) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }
}

/// Persists the model as pretty-printed JSON.
///
/// Stores write a sibling `.tmp` file that commit renames into place.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    path: PathBuf,
}

impl JsonFilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl ConfigurationPersister for JsonFilePersister {
    fn store(
        &self,
        root: &Resource,
        affected: &BTreeSet<PathAddress>,
    ) -> Result<Box<dyn ControllerResource>> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let staging = self.staging_path();
        let content = serde_json::to_string_pretty(root).context("Failed to serialize model")?;
        fs::write(&staging, content)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        log::debug!(
            "Staged configuration ({} changed resources) at {}",
            affected.len(),
            staging.display()
        );

        let target = self.path.clone();
        let commit_from = staging.clone();
        Ok(Box::new(CallbackResource::new(
            move || {
                fs::rename(&commit_from, &target).with_context(|| {
                    format!("Failed to move {} into place", commit_from.display())
                })?;
                log::debug!("Persisted configuration to {}", target.display());
                Ok(())
            },
            move || {
                if staging.exists() {
                    fs::remove_file(&staging)
                        .with_context(|| format!("Failed to remove {}", staging.display()))?;
                }
                Ok(())
            },
        )))
    }

    fn load(&self) -> Result<Vec<Operation>> {
        if !self.path.exists() {
            log::debug!("No stored configuration at {}", self.path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let root: Resource = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        let mut operations = Vec::new();
        for address in root.descendant_addresses() {
            let resource = root.navigate(&address)?;
            let mut op = Operation::new(names::ADD, address);
            op.params = resource.model().clone();
            operations.push(op);
        }
        log::debug!(
            "Loaded {} boot operations from {}",
            operations.len(),
            self.path.display()
        );
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Resource {
        let mut root = Resource::new();
        root.navigate_or_create(&"/subsystem=foo".parse().unwrap())
            .unwrap()
            .model_mut()
            .insert("value".to_string(), json!(5));
        root.navigate_or_create(&"/subsystem=foo/child=a".parse().unwrap())
            .unwrap();
        root
    }

    #[test]
    fn test_store_commit_and_load() {
        let temp = TempDir::new().unwrap();
        let persister = JsonFilePersister::new(temp.path().join("model.json"));

        let mut resource = persister.store(&sample(), &BTreeSet::new()).unwrap();
        assert!(!persister.path().exists());
        resource.commit().unwrap();
        assert!(persister.path().exists());

        let ops = persister.load().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].address.to_string(), "/subsystem=foo");
        assert_eq!(ops[0].get("value"), Some(&json!(5)));
        assert_eq!(ops[1].address.to_string(), "/subsystem=foo/child=a");
        assert!(ops.iter().all(|op| op.name == "add"));
    }

    #[test]
    fn test_store_rollback_discards() {
        let temp = TempDir::new().unwrap();
        let persister = JsonFilePersister::new(temp.path().join("model.json"));

        let mut resource = persister.store(&sample(), &BTreeSet::new()).unwrap();
        resource.rollback().unwrap();
        assert!(!persister.path().exists());
        assert!(!persister.staging_path().exists());
        assert!(persister.load().unwrap().is_empty());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFilePersister::new(path).load().is_err());
    }

    #[test]
    fn test_null_persister() {
        let mut resource = NullPersister.store(&sample(), &BTreeSet::new()).unwrap();
        resource.commit().unwrap();
        assert!(NullPersister.load().unwrap().is_empty());
    }
}

//! Controller transactions.
//!
//! Resources register themselves while an operation runs. When the
//! operation finishes, the transaction visits every resource in
//! registration order and either commits all of them or rolls all of them
//! back. A failing resource is logged and does not stop the others.

use chrono::{DateTime, Utc};
use log::{debug, error};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// A unit of work finalized with the transaction.
pub trait ControllerResource: Send {
    fn commit(&mut self) -> anyhow::Result<()>;
    fn rollback(&mut self) -> anyhow::Result<()>;
}

/// Hooks around transaction completion.
pub trait Synchronization: Send {
    /// Called before any resource is finalized.
    fn before_completion(&mut self) {}

    /// Called after every resource is finalized.
    fn after_completion(&mut self, _committed: bool) {}
}

/// How a transaction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

type Callback = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// A [`ControllerResource`] built from two closures.
pub struct CallbackResource {
    on_commit: Callback,
    on_rollback: Callback,
}

impl CallbackResource {
    pub fn new<C, R>(on_commit: C, on_rollback: R) -> Self
    where
        C: FnMut() -> anyhow::Result<()> + Send + 'static,
        R: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            on_commit: Box::new(on_commit),
            on_rollback: Box::new(on_rollback),
        }
    }
}

impl ControllerResource for CallbackResource {
    fn commit(&mut self) -> anyhow::Result<()> {
        (self.on_commit)()
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        (self.on_rollback)()
    }
}

/// Resources and synchronizations finalized together, exactly once.
pub struct ControllerTransaction {
    id: u64,
    created: DateTime<Utc>,
    rollback_only: bool,
    resources: Vec<Box<dyn ControllerResource>>,
    synchronizations: Vec<Box<dyn Synchronization>>,
}

impl ControllerTransaction {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed),
            created: Utc::now(),
            rollback_only: false,
            resources: Vec::new(),
            synchronizations: Vec::new(),
        }
    }

    /// Correlation id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn register_resource(&mut self, resource: Box<dyn ControllerResource>) {
        self.resources.push(resource);
    }

    pub fn register_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
        self.synchronizations.push(synchronization);
    }

    /// Mark the transaction for rollback. Cannot be undone.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Finalize every resource, committing unless marked rollback-only.
    pub fn commit(mut self) -> TransactionOutcome {
        for sync in &mut self.synchronizations {
            sync.before_completion();
        }

        let committed = !self.rollback_only;
        debug!(
            "Completing transaction {} ({} resources): {}",
            self.id,
            self.resources.len(),
            if committed { "commit" } else { "rollback" }
        );

        for (index, resource) in self.resources.iter_mut().enumerate() {
            let result = if committed {
                resource.commit()
            } else {
                resource.rollback()
            };
            if let Err(e) = result {
                error!(
                    "Transaction {} resource {} failed to {}: {e:#}",
                    self.id,
                    index,
                    if committed { "commit" } else { "roll back" }
                );
            }
        }

        for sync in &mut self.synchronizations {
            sync.after_completion(committed);
        }

        if committed {
            TransactionOutcome::Committed
        } else {
            TransactionOutcome::RolledBack
        }
    }

    /// Mark rollback-only and finalize.
    pub fn rollback(mut self) -> TransactionOutcome {
        self.set_rollback_only();
        self.commit()
    }
}

impl Default for ControllerTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControllerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerTransaction")
            .field("id", &self.id)
            .field("created", &self.created)
            .field("rollback_only", &self.rollback_only)
            .field("resources", &self.resources.len())
            .field("synchronizations", &self.synchronizations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str) -> Box<CallbackResource> {
        let on_commit = Arc::clone(log);
        let on_rollback = Arc::clone(log);
        Box::new(CallbackResource::new(
            move || {
                on_commit.lock().unwrap().push(format!("{name}:commit"));
                Ok(())
            },
            move || {
                on_rollback.lock().unwrap().push(format!("{name}:rollback"));
                Ok(())
            },
        ))
    }

    struct RecordingSync {
        log: Log,
    }

    impl Synchronization for RecordingSync {
        fn before_completion(&mut self) {
            self.log.lock().unwrap().push("before".to_string());
        }

        fn after_completion(&mut self, committed: bool) {
            self.log.lock().unwrap().push(format!("after:{committed}"));
        }
    }

    #[test]
    fn test_commit_in_registration_order() {
        let log = Log::default();
        let mut tx = ControllerTransaction::new();
        tx.register_synchronization(Box::new(RecordingSync { log: log.clone() }));
        tx.register_resource(recording(&log, "a"));
        tx.register_resource(recording(&log, "b"));

        assert!(tx.commit().is_committed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before", "a:commit", "b:commit", "after:true"]
        );
    }

    #[test]
    fn test_rollback_only_is_uniform() {
        let log = Log::default();
        let mut tx = ControllerTransaction::new();
        tx.register_resource(recording(&log, "a"));
        tx.set_rollback_only();
        tx.set_rollback_only();
        tx.register_resource(recording(&log, "b"));
        assert!(tx.is_rollback_only());

        assert_eq!(tx.commit(), TransactionOutcome::RolledBack);
        assert_eq!(*log.lock().unwrap(), vec!["a:rollback", "b:rollback"]);
    }

    #[test]
    fn test_failing_resource_does_not_stop_others() {
        let log = Log::default();
        let mut tx = ControllerTransaction::new();
        tx.register_resource(Box::new(CallbackResource::new(
            || anyhow::bail!("disk full"),
            || Ok(()),
        )));
        tx.register_resource(recording(&log, "b"));

        assert!(tx.commit().is_committed());
        assert_eq!(*log.lock().unwrap(), vec!["b:commit"]);
    }

    #[test]
    fn test_rollback_helper() {
        let log = Log::default();
        let mut tx = ControllerTransaction::new();
        tx.register_synchronization(Box::new(RecordingSync { log: log.clone() }));
        tx.register_resource(recording(&log, "a"));

        assert_eq!(tx.rollback(), TransactionOutcome::RolledBack);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before", "a:rollback", "after:false"]
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let first = ControllerTransaction::new();
        let second = ControllerTransaction::new();
        assert_ne!(first.id(), second.id());
        assert!(first.created() <= second.created());
    }
}

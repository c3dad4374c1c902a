//! Controlled process state: running, reload-required, restart-required.
//!
//! Operations that change attributes which only take effect after a reload
//! or restart move the process into the matching state. Each transition
//! returns a stamp; reverting with that stamp undoes the transition only if
//! nothing has changed the state since.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    Running,
    ReloadRequired,
    RestartRequired,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::ReloadRequired => "reload-required",
            Self::RestartRequired => "restart-required",
        })
    }
}

/// Token identifying one state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp(u64);

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    previous: ProcessState,
    stamp: u64,
}

#[derive(Debug)]
pub struct ControlledProcessState {
    inner: Mutex<Inner>,
}

impl Default for ControlledProcessState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ProcessState::Running,
                previous: ProcessState::Running,
                stamp: 0,
            }),
        }
    }
}

impl ControlledProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.inner().state
    }

    pub fn set_reload_required(&self) -> Stamp {
        self.escalate(ProcessState::ReloadRequired)
    }

    pub fn set_restart_required(&self) -> Stamp {
        self.escalate(ProcessState::RestartRequired)
    }

    /// Undo a reload-required transition made with `stamp`.
    pub fn revert_reload_required(&self, stamp: Stamp) -> bool {
        self.revert(ProcessState::ReloadRequired, stamp)
    }

    /// Undo a restart-required transition made with `stamp`.
    pub fn revert_restart_required(&self, stamp: Stamp) -> bool {
        self.revert(ProcessState::RestartRequired, stamp)
    }

    /// Back to running, as after a completed reload.
    pub fn set_running(&self) {
        let mut inner = self.inner();
        inner.stamp += 1;
        inner.previous = ProcessState::Running;
        inner.state = ProcessState::Running;
    }

    fn escalate(&self, target: ProcessState) -> Stamp {
        let mut inner = self.inner();
        if target > inner.state {
            inner.previous = inner.state;
            inner.state = target;
            inner.stamp += 1;
            log::info!("Process state changed to {target}");
        }
        Stamp(inner.stamp)
    }

    fn revert(&self, expected: ProcessState, stamp: Stamp) -> bool {
        let mut inner = self.inner();
        if inner.state != expected || inner.stamp != stamp.0 {
            return false;
        }
        inner.state = inner.previous;
        inner.previous = ProcessState::Running;
        inner.stamp += 1;
        true
    }
}

//! Execution stages and step result actions.

use std::fmt;

/// Phase of operation execution.
///
/// Steps run stage by stage; a context never moves backwards.
/// [`Stage::Immediate`] is not a phase of its own: steps added with it run
/// next, ahead of everything queued in the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Immediate,
    /// Validate input and update the working model
    Model,
    /// Apply changes to runtime services
    Runtime,
    /// Check that runtime changes took effect
    Verify,
    /// Commit or roll back
    Done,
}

impl Stage {
    /// The stage that follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::Immediate | Self::Model => Self::Runtime,
            Self::Runtime => Self::Verify,
            Self::Verify | Self::Done => Self::Done,
        }
    }

    pub(crate) fn queue_index(self) -> Option<usize> {
        match self {
            Self::Model => Some(0),
            Self::Runtime => Some(1),
            Self::Verify => Some(2),
            Self::Immediate | Self::Done => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Immediate => "IMMEDIATE",
            Self::Model => "MODEL",
            Self::Runtime => "RUNTIME",
            Self::Verify => "VERIFY",
            Self::Done => "DONE",
        })
    }
}

/// What the context decided to do with the operation's changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultAction {
    #[default]
    Keep,
    Rollback,
}

impl ResultAction {
    pub fn is_rollback(self) -> bool {
        matches!(self, Self::Rollback)
    }
}

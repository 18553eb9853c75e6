//! Lifecycle state for the process-wide Time Manager.
//!
//! UNINITIALIZED → RUNNING → SHUTTING_DOWN → STOPPED, with STOPPED → RUNNING
//! allowed so a process can re-initialize after a clean shutdown.

use crate::error::{TmError, TmResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of the Time Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerState {
    /// Nothing initialized yet.
    #[default]
    Uninitialized,
    /// Time base calibrated, queue and core live; accepting work.
    Running,
    /// Teardown in progress; new work is rejected.
    ShuttingDown,
    /// Fully torn down.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "UNINITIALIZED"),
            Self::Running => write!(f, "RUNNING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl ManagerState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ManagerState) -> bool {
        use ManagerState::{Running, ShuttingDown, Stopped, Uninitialized};

        matches!(
            (self, target),
            (Uninitialized, Running)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
                | (Stopped, Running)
        )
    }

    /// Attempt to transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::InvalidStateTransition`] if the transition is not allowed.
    pub fn transition_to(&mut self, target: ManagerState) -> TmResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(TmError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true while the manager accepts task operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

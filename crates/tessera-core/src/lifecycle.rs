use crate::CoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution stages, in the only order a transaction may visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Model,
    Runtime,
    Verify,
    Domain,
    Done,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Model => Some(Stage::Runtime),
            Stage::Runtime => Some(Stage::Verify),
            Stage::Verify => Some(Stage::Domain),
            Stage::Domain => Some(Stage::Done),
            Stage::Done => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Model => write!(f, "model"),
            Stage::Runtime => write!(f, "runtime"),
            Stage::Verify => write!(f, "verify"),
            Stage::Domain => write!(f, "domain"),
            Stage::Done => write!(f, "done"),
        }
    }
}

pub fn validate_stage_transition(from: Stage, to: Stage) -> Result<(), CoreError> {
    if from.next() == Some(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    #[default]
    Keep,
    Rollback,
}

impl fmt::Display for ResultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultAction::Keep => write!(f, "keep"),
            ResultAction::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningState {
    Running,
    ReloadRequired,
    RestartRequired,
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningState::Running => write!(f, "running"),
            RunningState::ReloadRequired => write!(f, "reload-required"),
            RunningState::RestartRequired => write!(f, "restart-required"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: RunningState,
    /// Set when runtime services stopped matching the model. Never cleared.
    pub unstable: bool,
}

#[derive(Debug, Default)]
struct ProcessFlags {
    reload: bool,
    restart: bool,
    unstable: bool,
    stuck_removals: bool,
}

/// Process-wide running state shared by every transaction.
#[derive(Debug, Default)]
pub struct ProcessState {
    flags: Mutex<ProcessFlags>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ProcessStatus {
        let flags = self.flags.lock();
        let state = if flags.restart || flags.unstable || flags.stuck_removals {
            RunningState::RestartRequired
        } else if flags.reload {
            RunningState::ReloadRequired
        } else {
            RunningState::Running
        };
        ProcessStatus {
            state,
            unstable: flags.unstable,
        }
    }

    /// Returns true if this call changed the flag.
    pub fn require_reload(&self) -> bool {
        !std::mem::replace(&mut self.flags.lock().reload, true)
    }

    pub fn require_restart(&self) -> bool {
        !std::mem::replace(&mut self.flags.lock().restart, true)
    }

    pub fn revert_reload(&self) {
        self.flags.lock().reload = false;
    }

    pub fn revert_restart(&self) {
        self.flags.lock().restart = false;
    }

    pub fn mark_unstable(&self) {
        self.flags.lock().unstable = true;
    }

    /// A rollback left services mid-removal. Implies restart-required and is never cleared.
    pub fn mark_stuck_removals(&self) {
        self.flags.lock().stuck_removals = true;
    }

    pub fn is_unstable(&self) -> bool {
        self.flags.lock().unstable
    }
}

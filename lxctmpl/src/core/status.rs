//! Step outcome and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The signal a step returns after executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Abort remaining steps and unwind. The step stored its error in the run state.
    Halt,
    /// Cancellation was observed inside the step.
    Cancelled,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Halt => write!(f, "halt"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The state of a pipeline run.
///
/// `Idle → Running → {Completed, Halted, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Not started yet.
    #[default]
    Idle,
    /// Steps are executing.
    Running,
    /// Every step continued.
    Completed,
    /// A step halted the run.
    Halted,
    /// The host cancelled the run.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Halted | Self::Cancelled)
    }

    /// Returns true if every step ran to completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true if the run stopped early.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Halted | Self::Cancelled)
    }
}

//! Worker lifecycle state.

use serde::{Deserialize, Serialize};

/// Scan worker state.
///
/// # State Machine
///
/// ```text
/// Idle ──set_scan_params──> ParamsSet ──scan──> Running ──> Completed
///                             │     ▲              │
///                             └─────┘              └──────> Aborted
///                          set_scan_params
/// ```
///
/// A worker never leaves `Completed` or `Aborted`: the supervisor discards it
/// and spawns a fresh one in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// No parameters stored
    Idle,
    /// Parameters validated and stored
    ParamsSet,
    /// Sweep in progress
    Running,
    /// Sweep finished every point
    Completed,
    /// Sweep was cancelled or failed
    Aborted,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "Idle"),
            WorkerState::ParamsSet => write!(f, "ParamsSet"),
            WorkerState::Running => write!(f, "Running"),
            WorkerState::Completed => write!(f, "Completed"),
            WorkerState::Aborted => write!(f, "Aborted"),
        }
    }
}

impl WorkerState {
    /// Check if the state allows storing new parameters.
    pub fn can_set_params(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::ParamsSet)
    }

    /// Check if the state allows starting a sweep.
    pub fn can_scan(&self) -> bool {
        matches!(self, WorkerState::ParamsSet)
    }

    /// Check if the worker is finished and must be recycled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Aborted)
    }
}

//! Worker descriptors and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one launch. A model relaunched after a crash gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a tracked worker.
///
/// `Starting -> Running -> {Exited | Failed}`. Terminal states stay in the
/// registry until the worker is explicitly stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum WorkerState {
    Starting,
    Running,
    /// Clean exit; the code is always 0.
    Exited { code: i32 },
    /// Nonzero exit, or the process status could not be read.
    Failed { code: Option<i32>, reason: String },
}

impl WorkerState {
    /// State recorded for an observed exit code.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            WorkerState::Exited { code }
        } else {
            WorkerState::Failed {
                code: Some(code),
                reason: format!("exited with code {}", code),
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Exited { .. } | WorkerState::Failed { .. })
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            WorkerState::Exited { code } => Some(*code),
            WorkerState::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Exited { code } => write!(f, "exited({})", code),
            WorkerState::Failed {
                code: Some(code), ..
            } => write!(f, "failed({})", code),
            WorkerState::Failed { code: None, reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Point-in-time view of a registry entry. Never carries the process handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub model: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub launched_at: DateTime<Utc>,
    pub state: WorkerState,
}

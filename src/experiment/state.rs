//! Runner lifecycle and run records.

use crate::error::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Protocol runner state.
///
/// ```text
/// Idle ──start──> Running ──────────────> Completed
///                  │  ▲   ▲
///             pause│  │   │ack
///                  ▼  │   │
///                Paused  AwaitingAck
///
/// Running | Paused | AwaitingAck ──cancel──> Cancelled
/// Running | Paused | AwaitingAck ──device fault──> Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    Idle,
    Running,
    Paused,
    /// Blocked on an ask step until acknowledged.
    AwaitingAck,
    Completed,
    Cancelled,
    Faulted,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Idle => write!(f, "Idle"),
            RunnerState::Running => write!(f, "Running"),
            RunnerState::Paused => write!(f, "Paused"),
            RunnerState::AwaitingAck => write!(f, "AwaitingAck"),
            RunnerState::Completed => write!(f, "Completed"),
            RunnerState::Cancelled => write!(f, "Cancelled"),
            RunnerState::Faulted => write!(f, "Faulted"),
        }
    }
}

impl RunnerState {
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            RunnerState::Idle
                | RunnerState::Completed
                | RunnerState::Cancelled
                | RunnerState::Faulted
        )
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, RunnerState::Running | RunnerState::AwaitingAck)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            RunnerState::Running | RunnerState::Paused | RunnerState::AwaitingAck
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Cancelled | RunnerState::Faulted
        )
    }
}

/// Outcome of one protocol run, serializable as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub protocol: String,
    pub simulation: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunnerState,
    /// Steps executed, loop repeats included.
    pub steps_executed: usize,
    /// Steps the device rejected and the runner skipped.
    pub steps_rejected: usize,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(protocol: impl Into<String>, simulation: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            protocol: protocol.into(),
            simulation,
            started_at: Utc::now(),
            finished_at: None,
            state: RunnerState::Running,
            steps_executed: 0,
            steps_rejected: 0,
            error: None,
        }
    }

    pub fn finish(&mut self, state: RunnerState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// `runs/<run_id>.json`
    pub fn default_path(&self) -> PathBuf {
        PathBuf::from("runs").join(format!("{}.json", self.run_id))
    }
}

//! Task state machine
//!
//! ```text
//! queued ──start──► running ──succeed──► success
//!                      │
//!                      └─────fail──────► failed
//! ```

use chrono::{DateTime, Utc};
use harbor_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a free worker
    Queued,

    /// Owned by exactly one worker
    Running,

    /// Handler returned a result
    Success,

    /// Handler returned an error, panicked, or was interrupted
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown task status: {}", other))),
        }
    }
}

/// The only allowed lifecycle edges, with the data each one sets
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start {
        started_at: DateTime<Utc>,
    },
    Succeed {
        result: Value,
        finished_at: DateTime<Utc>,
    },
    Fail {
        error: String,
        finished_at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self::Start { started_at }
    }

    pub fn succeed(result: Value, finished_at: DateTime<Utc>) -> Self {
        Self::Succeed {
            result,
            finished_at,
        }
    }

    pub fn fail(error: impl Into<String>, finished_at: DateTime<Utc>) -> Self {
        Self::Fail {
            error: error.into(),
            finished_at,
        }
    }

    /// Required current status
    pub fn from(&self) -> TaskStatus {
        match self {
            Transition::Start { .. } => TaskStatus::Queued,
            Transition::Succeed { .. } | Transition::Fail { .. } => TaskStatus::Running,
        }
    }

    /// Resulting status
    pub fn to(&self) -> TaskStatus {
        match self {
            Transition::Start { .. } => TaskStatus::Running,
            Transition::Succeed { .. } => TaskStatus::Success,
            Transition::Fail { .. } => TaskStatus::Failed,
        }
    }
}

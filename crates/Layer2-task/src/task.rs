//! Task definition and types

use crate::state::{TaskStatus, Transition};
use chrono::{DateTime, Utc};
use harbor_foundation::{DangerousAction, Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// Unique identifier for a task
///
/// Generated ids are 32 lowercase hex chars. Parsed ids must match
/// `^[a-zA-Z0-9_-]{1,64}$` so they are safe to use as file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validate an externally supplied id
    pub fn parse(raw: &str) -> Result<Self> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let valid = PATTERN
            .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").ok())
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(raw));

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidInput(format!("Invalid task_id: {:?}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ============================================================================
// Task Kind
// ============================================================================

/// Every task type the engine knows. The wire string is the stable name
/// stored in `task_type` and accepted over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    ImagePull,
    ImageBuild,
    ImageBuildUpload,
    ImageLoad,
    ImageLoadUrl,
    ImageSave,
    ImageRemove,
    GitClone,
    GitSync,
    GitBuild,
    GitComposeAction,
    GitWorkspaceDelete,
    GitComposeOverrideClear,
    StackAction,
    ContainerLogsExport,
    ContainerRemove,
    ContainerKill,
    ContainerBatchStop,
}

impl TaskKind {
    pub const ALL: [TaskKind; 18] = [
        TaskKind::ImagePull,
        TaskKind::ImageBuild,
        TaskKind::ImageBuildUpload,
        TaskKind::ImageLoad,
        TaskKind::ImageLoadUrl,
        TaskKind::ImageSave,
        TaskKind::ImageRemove,
        TaskKind::GitClone,
        TaskKind::GitSync,
        TaskKind::GitBuild,
        TaskKind::GitComposeAction,
        TaskKind::GitWorkspaceDelete,
        TaskKind::GitComposeOverrideClear,
        TaskKind::StackAction,
        TaskKind::ContainerLogsExport,
        TaskKind::ContainerRemove,
        TaskKind::ContainerKill,
        TaskKind::ContainerBatchStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImagePull => "image.pull",
            Self::ImageBuild => "image.build",
            Self::ImageBuildUpload => "image.build.upload",
            Self::ImageLoad => "image.load",
            Self::ImageLoadUrl => "image.load.url",
            Self::ImageSave => "image.save",
            Self::ImageRemove => "image.remove",
            Self::GitClone => "image.git.clone",
            Self::GitSync => "image.git.sync",
            Self::GitBuild => "image.git.build",
            Self::GitComposeAction => "image.git.compose.action",
            Self::GitWorkspaceDelete => "image.git.workspace.delete",
            Self::GitComposeOverrideClear => "image.git.compose.override.clear",
            Self::StackAction => "stack.action",
            Self::ContainerLogsExport => "container.logs.export",
            Self::ContainerRemove => "container.remove",
            Self::ContainerKill => "container.kill",
            Self::ContainerBatchStop => "container.batch_stop",
        }
    }

    /// Resource family recorded on the task row
    pub fn resource_type(&self) -> &'static str {
        match self {
            Self::ImagePull
            | Self::ImageBuild
            | Self::ImageBuildUpload
            | Self::ImageLoad
            | Self::ImageLoadUrl
            | Self::ImageSave
            | Self::ImageRemove => "image",
            Self::GitClone
            | Self::GitSync
            | Self::GitBuild
            | Self::GitWorkspaceDelete
            | Self::GitComposeOverrideClear => "workspace",
            Self::GitComposeAction | Self::StackAction => "stack",
            Self::ContainerLogsExport
            | Self::ContainerRemove
            | Self::ContainerKill
            | Self::ContainerBatchStop => "container",
        }
    }

    /// Best-effort resource id derived from params
    pub fn resource_id(&self, params: &Value) -> Option<String> {
        let field = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_string);
        match self {
            Self::ImagePull => field("image").map(|image| match field("tag") {
                Some(tag) => format!("{}:{}", image, tag),
                None => image,
            }),
            Self::ImageBuild | Self::ImageBuildUpload | Self::GitBuild => field("tag"),
            Self::ImageSave | Self::ImageRemove => field("image"),
            Self::ImageLoadUrl => field("url"),
            Self::GitClone => field("repo_url"),
            Self::GitSync | Self::GitWorkspaceDelete | Self::GitComposeOverrideClear => {
                field("workspace_id")
            }
            Self::GitComposeAction => field("project_name"),
            Self::StackAction => field("name"),
            Self::ContainerLogsExport | Self::ContainerRemove | Self::ContainerKill => {
                field("container_id")
            }
            Self::ImageLoad | Self::ContainerBatchStop => None,
        }
    }

    /// Dangerous action this request performs, if any
    pub fn danger(&self, params: &Value) -> Option<DangerousAction> {
        let flag = |name: &str| params.get(name).and_then(Value::as_bool).unwrap_or(false);
        match self {
            Self::ImageRemove => Some(DangerousAction::RemoveImage),
            Self::ContainerRemove => Some(DangerousAction::RemoveContainer),
            Self::ContainerKill => Some(DangerousAction::Kill),
            Self::ContainerBatchStop => Some(DangerousAction::BatchStop),
            Self::GitWorkspaceDelete => Some(DangerousAction::DeleteWorkspace),
            Self::GitComposeOverrideClear => Some(DangerousAction::ClearOverride),
            Self::ImageBuild | Self::ImageBuildUpload | Self::GitBuild if flag("no_cache") => {
                Some(DangerousAction::ForceRebuild)
            }
            Self::StackAction | Self::GitComposeAction
                if flag("force_recreate")
                    && params.get("action").and_then(Value::as_str) == Some("up") =>
            {
                Some(DangerousAction::ForceRecreate)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnregisteredTaskType(s.to_string()))
    }
}

// ============================================================================
// Task
// ============================================================================

/// Input for creating a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub params: Value,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub created_by: String,
    pub retry_of: Option<TaskId>,
}

/// A durable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Wire name of the task type
    pub task_type: String,

    /// Current lifecycle status
    pub status: TaskStatus,

    pub resource_type: Option<String>,

    pub resource_id: Option<String>,

    /// Handler input, stored as submitted (may contain secrets)
    pub params: Value,

    /// Handler output, set once on success
    pub result: Option<Value>,

    /// Failure message, set once on failure
    pub error: Option<String>,

    /// Failed task this one retries
    pub retry_of: Option<TaskId>,

    /// Actor that requested the task
    pub created_by: String,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a queued task
    pub fn queued(new: NewTask) -> Self {
        Self {
            id: TaskId::new(),
            task_type: new.task_type,
            status: TaskStatus::Queued,
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            params: new.params,
            result: None,
            error: None,
            retry_of: new.retry_of,
            created_by: new.created_by,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Known kind for this task's type, if any
    pub fn kind(&self) -> Option<TaskKind> {
        self.task_type.parse().ok()
    }

    /// Apply a lifecycle transition, rejecting anything but the allowed edges
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        if self.status != transition.from() {
            return Err(Error::invalid_transition(
                self.id.as_str(),
                self.status.as_str(),
                transition.to().as_str(),
            ));
        }

        match transition {
            Transition::Start { started_at } => {
                self.status = TaskStatus::Running;
                self.started_at = Some(started_at);
            }
            Transition::Succeed {
                result,
                finished_at,
            } => {
                self.status = TaskStatus::Success;
                self.result = Some(result);
                self.finished_at = Some(finished_at);
            }
            Transition::Fail { error, finished_at } => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
                self.finished_at = Some(finished_at);
            }
        }

        Ok(())
    }

    /// Duration from start to finish
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

//! Task Service - the only entry point outer layers use
//!
//! Enqueue, retry, inspection, log tail and artifact download. The
//! Confirmation Gate runs here, before anything is persisted.

use crate::handlers::ensure_within;
use crate::log::{TaskLogSink, DEFAULT_LOG_TAIL_LINES, MAX_LOG_TAIL_LINES};
use crate::registry::HandlerRegistry;
use crate::scheduler::{QueueSlot, Scheduler};
use crate::state::TaskStatus;
use crate::store::{TaskFilter, TaskStore};
use crate::task::{NewTask, Task, TaskId, TaskKind};
use chrono::{DateTime, Utc};
use harbor_foundation::{
    redact, require_confirmation, AuditAction, AuditEntry, AuditLogger, AuditStatus, Confirmation,
    Error, Result,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Default page size for listings
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Largest page size for listings
pub const MAX_LIST_LIMIT: usize = 500;

/// Enqueue input
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_type: String,
    pub params: Value,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub actor: String,
    pub confirmation: Confirmation,
}

impl EnqueueRequest {
    pub fn new(task_type: impl Into<String>, params: Value, actor: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            params,
            resource_type: None,
            resource_id: None,
            actor: actor.into(),
            confirmation: Confirmation::none(),
        }
    }

    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: Option<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = resource_id;
        self
    }

    pub fn confirmed(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = confirmation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub original_task_id: TaskId,
    pub new_task_id: TaskId,
}

/// Task as shown to callers; params and result are redacted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_of: Option<TaskId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let duration_ms = task.duration().map(|d| d.num_milliseconds());
        Self {
            params: redact(&task.params),
            result: task.result.as_ref().map(redact),
            id: task.id,
            task_type: task.task_type,
            status: task.status,
            resource_type: task.resource_type,
            resource_id: task.resource_id,
            error: task.error,
            retry_of: task.retry_of,
            created_by: task.created_by,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            duration_ms,
        }
    }
}

/// Artifact produced by a successful task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDownload {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

/// Listing query as received from callers
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<Scheduler>,
    logs: Arc<TaskLogSink>,
    audit: AuditLogger,
    /// Directories a downloadable artifact may live in
    artifact_dirs: Vec<PathBuf>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        scheduler: Arc<Scheduler>,
        logs: Arc<TaskLogSink>,
        audit: AuditLogger,
        artifact_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            logs,
            audit,
            artifact_dirs,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Gate, persist and submit a new task
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId> {
        let (kind, _) = self.registry.resolve(&request.task_type)?;
        if !request.params.is_object() {
            return Err(Error::InvalidInput("params must be a JSON object".to_string()));
        }
        self.gate(kind, &request.params, &request.confirmation, &request.actor)?;
        let slot = self.scheduler.reserve()?;

        let resource_type = request
            .resource_type
            .unwrap_or_else(|| kind.resource_type().to_string());
        let resource_id = request.resource_id.or_else(|| kind.resource_id(&request.params));

        let task = self
            .store
            .create(Task::queued(NewTask {
                task_type: kind.as_str().to_string(),
                params: request.params,
                resource_type: Some(resource_type),
                resource_id,
                created_by: request.actor,
                retry_of: None,
            }))
            .await?;

        self.admit(&task, slot, AuditAction::TaskEnqueue, None).await;
        Ok(task.id)
    }

    /// New task with the same type and params as a failed one
    ///
    /// `overrides` are merged shallowly over the original params.
    pub async fn retry(
        &self,
        task_id: &TaskId,
        actor: &str,
        overrides: Option<Map<String, Value>>,
        confirmation: &Confirmation,
    ) -> Result<RetryOutcome> {
        let original = self.store.get(task_id).await?;
        if original.status != TaskStatus::Failed {
            return Err(Error::NotRetryable {
                task_id: task_id.to_string(),
                status: original.status.to_string(),
            });
        }
        let (kind, _) = self.registry.resolve(&original.task_type)?;

        let mut params = original.params.clone();
        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            match &mut params {
                Value::Object(map) => map.extend(overrides),
                _ => params = Value::Object(overrides),
            }
            self.gate(kind, &params, confirmation, actor)?;
        }
        let slot = self.scheduler.reserve()?;

        let task = self
            .store
            .create(Task::queued(NewTask {
                task_type: original.task_type.clone(),
                params,
                resource_type: original.resource_type.clone(),
                resource_id: original.resource_id.clone(),
                created_by: actor.to_string(),
                retry_of: Some(original.id.clone()),
            }))
            .await?;

        self.admit(
            &task,
            slot,
            AuditAction::TaskRetry,
            Some(json!({ "original_task_id": original.id })),
        )
        .await;
        info!(original = %original.id, task_id = %task.id, "Task retried");
        Ok(RetryOutcome {
            original_task_id: original.id,
            new_task_id: task.id,
        })
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<TaskView> {
        Ok(self.store.get(task_id).await?.into())
    }

    /// Newest first
    pub async fn list(&self, query: ListQuery) -> Result<Vec<TaskView>> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let filter = TaskFilter {
            status: query.status,
            task_type: query.task_type,
            limit: Some(limit),
            ..TaskFilter::default()
        };
        let tasks = self.store.list(&filter).await?;
        Ok(tasks.into_iter().map(TaskView::from).collect())
    }

    /// Last `tail` lines of the task's log
    pub async fn logs(&self, task_id: &TaskId, tail: Option<usize>) -> Result<String> {
        self.store.get(task_id).await?;
        let tail = tail
            .unwrap_or(DEFAULT_LOG_TAIL_LINES)
            .min(MAX_LOG_TAIL_LINES);
        self.logs.tail(task_id, tail).await
    }

    /// Locate the file a successful task produced
    pub async fn download(&self, task_id: &TaskId) -> Result<TaskDownload> {
        let task = self.store.get(task_id).await?;
        if task.status != TaskStatus::Success {
            return Err(Error::NotReady(format!(
                "Task {} is {}, not success",
                task_id, task.status
            )));
        }
        let file = task
            .result
            .as_ref()
            .and_then(|r| r.get("file"))
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::NotReady(format!("Task {} produced no file", task_id)))?;

        let path = PathBuf::from(file);
        if !path.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", file)));
        }
        let path = self
            .artifact_dirs
            .iter()
            .find_map(|dir| ensure_within(dir, &path).ok())
            .ok_or_else(|| Error::Forbidden(format!("{} is not a task artifact", file)))?;

        let size = tokio::fs::metadata(&path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        Ok(TaskDownload {
            path,
            filename,
            size,
        })
    }

    fn gate(
        &self,
        kind: TaskKind,
        params: &Value,
        confirmation: &Confirmation,
        actor: &str,
    ) -> Result<()> {
        let Some(action) = kind.danger(params) else {
            return Ok(());
        };
        require_confirmation(confirmation, action).inspect_err(|_| {
            warn!(task_type = %kind, action = %action, actor, "Confirmation missing");
            self.audit.log(
                AuditEntry::new(AuditAction::ConfirmationRejected, actor)
                    .with_status(AuditStatus::Denied)
                    .with_resource(kind.resource_type(), kind.resource_id(params))
                    .with_detail(json!({ "task_type": kind.as_str(), "action": action.as_str() })),
            );
        })
    }

    /// Queued log line, audit row, hand-off to the pool
    async fn admit(
        &self,
        task: &Task,
        slot: QueueSlot,
        action: AuditAction,
        extra: Option<Value>,
    ) {
        self.logs
            .append(
                &task.id,
                &format!(
                    "# queued task_type={} created_by={}",
                    task.task_type, task.created_by
                ),
            )
            .await;

        let mut detail = json!({
            "task_type": task.task_type,
            "resource_type": task.resource_type,
            "resource_id": task.resource_id,
            "params": redact(&task.params),
        });
        if let (Value::Object(detail), Some(Value::Object(extra))) = (&mut detail, extra) {
            detail.extend(extra);
        }
        self.audit.log(
            AuditEntry::new(action, task.created_by.clone())
                .with_resource("task", Some(task.id.to_string()))
                .with_detail(detail),
        );

        info!(task_id = %task.id, task_type = %task.task_type, actor = %task.created_by, "Task queued");
        slot.submit(task.id.clone());
    }
}

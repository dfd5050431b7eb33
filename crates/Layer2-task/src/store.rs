//! Task Store - durable task records with guarded transitions
//!
//! Two backends:
//! - [`MemoryTaskStore`]: per-task locks, for tests and ephemeral runs
//! - [`SqliteTaskStore`]: compare-and-set updates on the foundation `Storage`

use crate::state::{TaskStatus, Transition};
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use harbor_foundation::{Error, Result, Storage, TaskOutcomeRecord, TaskQuery, TaskRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub created_by: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .task_type
                .as_ref()
                .map_or(true, |t| &task.task_type == t)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |r| task.resource_type.as_ref() == Some(r))
            && self
                .resource_id
                .as_ref()
                .map_or(true, |r| task.resource_id.as_ref() == Some(r))
            && self
                .created_by
                .as_ref()
                .map_or(true, |c| &task.created_by == c)
    }
}

/// Persistence contract for tasks
///
/// Same-id transitions are serialised; different ids never block each other.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly queued task
    async fn create(&self, task: Task) -> Result<Task>;

    /// Fetch one task (`NotFound` if absent)
    async fn get(&self, id: &TaskId) -> Result<Task>;

    /// Newest first
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Apply a lifecycle edge (`InvalidTransition` if the current status disagrees)
    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task>;

    /// Ids with the given status, oldest first
    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>>;

    async fn count(&self) -> Result<usize>;
}

fn not_found(id: &TaskId) -> Error {
    Error::NotFound(format!("Task {} not found", id))
}

// ============================================================================
// Memory Store
// ============================================================================

struct MemoryEntry {
    seq: u64,
    task: Mutex<Task>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Arc<MemoryEntry>>>,
    seq: AtomicU64,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &TaskId) -> Result<Arc<MemoryEntry>> {
        self.tasks.read().get(id).cloned().ok_or_else(|| not_found(id))
    }

    fn snapshot(&self) -> Vec<(u64, Task)> {
        let entries: Vec<Arc<MemoryEntry>> = self.tasks.read().values().cloned().collect();
        entries
            .into_iter()
            .map(|e| (e.seq, e.task.lock().clone()))
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(Error::Storage(format!("Task {} already exists", task.id)));
        }
        let entry = MemoryEntry {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            task: Mutex::new(task.clone()),
        };
        tasks.insert(task.id.clone(), Arc::new(entry));
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Task> {
        let entry = self.entry(id)?;
        let task = entry.task.lock().clone();
        Ok(task)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<(u64, Task)> = self
            .snapshot()
            .into_iter()
            .filter(|(_, t)| filter.matches(t))
            .collect();
        tasks.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(tasks.into_iter().take(limit).map(|(_, t)| t).collect())
    }

    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task> {
        let entry = self.entry(id)?;
        let mut task = entry.task.lock();
        task.apply(transition)?;
        Ok(task.clone())
    }

    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>> {
        let mut tasks: Vec<(u64, Task)> = self
            .snapshot()
            .into_iter()
            .filter(|(_, t)| t.status == status)
            .collect();
        tasks.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        Ok(tasks.into_iter().map(|(_, t)| t.id).collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.tasks.read().len())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed store. Blocking calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    storage: Storage,
}

impl SqliteTaskStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| Error::Internal(format!("Storage task failed: {}", e)))?
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

impl TryFrom<&Task> for TaskRecord {
    type Error = Error;

    fn try_from(task: &Task) -> Result<Self> {
        Ok(TaskRecord {
            id: task.id.to_string(),
            task_type: task.task_type.clone(),
            status: task.status.as_str().to_string(),
            resource_type: task.resource_type.clone(),
            resource_id: task.resource_id.clone(),
            params: serde_json::to_string(&task.params)?,
            result: task.result.as_ref().map(serde_json::to_string).transpose()?,
            error: task.error.clone(),
            retry_of: task.retry_of.as_ref().map(|id| id.to_string()),
            created_by: task.created_by.clone(),
            created_at: format_ts(&task.created_at),
            started_at: task.started_at.as_ref().map(format_ts),
            finished_at: task.finished_at.as_ref().map(format_ts),
        })
    }
}

impl TryFrom<TaskRecord> for Task {
    type Error = Error;

    fn try_from(record: TaskRecord) -> Result<Self> {
        Ok(Task {
            id: TaskId::parse(&record.id)?,
            task_type: record.task_type,
            status: record.status.parse()?,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            params: serde_json::from_str(&record.params)?,
            result: record
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: record.error,
            retry_of: record.retry_of.as_deref().map(TaskId::parse).transpose()?,
            created_by: record.created_by,
            created_at: parse_ts(&record.created_at)?,
            started_at: parse_opt_ts(record.started_at.as_deref())?,
            finished_at: parse_opt_ts(record.finished_at.as_deref())?,
        })
    }
}

fn load(storage: &Storage, id: &TaskId) -> Result<Task> {
    storage
        .get_task(id.as_str())?
        .ok_or_else(|| not_found(id))
        .and_then(Task::try_from)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: Task) -> Result<Task> {
        let record = TaskRecord::try_from(&task)?;
        self.blocking(move |storage| storage.insert_task(&record))
            .await?;
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Task> {
        let id = id.clone();
        self.blocking(move |storage| load(storage, &id)).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let query = TaskQuery {
            status: filter.status.map(|s| s.as_str().to_string()),
            task_type: filter.task_type.clone(),
            resource_type: filter.resource_type.clone(),
            resource_id: filter.resource_id.clone(),
            created_by: filter.created_by.clone(),
            limit: filter.limit.map(|l| l.min(u32::MAX as usize) as u32),
        };
        let records = self
            .blocking(move |storage| storage.list_tasks(&query))
            .await?;
        records.into_iter().map(Task::try_from).collect()
    }

    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task> {
        let id = id.clone();
        self.blocking(move |storage| {
            let mut task = load(storage, &id)?;
            let expected = transition.from();
            task.apply(transition)?;

            // The row only changes if it still holds the status we validated against.
            let applied = match task.status {
                TaskStatus::Running => {
                    let started_at = task.started_at.as_ref().map(format_ts).unwrap_or_default();
                    storage.mark_task_started(id.as_str(), &started_at)?
                }
                status => {
                    let outcome = TaskOutcomeRecord {
                        status: status.as_str().to_string(),
                        result: task.result.as_ref().map(serde_json::to_string).transpose()?,
                        error: task.error.clone(),
                        finished_at: task.finished_at.as_ref().map(format_ts).unwrap_or_default(),
                    };
                    storage.mark_task_finished(id.as_str(), &outcome)?
                }
            };

            if applied {
                return Ok(task);
            }

            let current = load(storage, &id)?;
            debug!(task_id = %id, expected = %expected, actual = %current.status, "Lost transition race");
            Err(Error::invalid_transition(
                id.as_str(),
                current.status.as_str(),
                task.status.as_str(),
            ))
        })
        .await
    }

    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>> {
        let ids = self
            .blocking(move |storage| storage.task_ids_with_status(status.as_str()))
            .await?;
        ids.iter().map(|id| TaskId::parse(id)).collect()
    }

    async fn count(&self) -> Result<usize> {
        let count = self.blocking(|storage| storage.count_tasks()).await?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use serde_json::json;

    fn queued(task_type: &str) -> Task {
        Task::queued(NewTask {
            task_type: task_type.to_string(),
            params: json!({"image": "nginx", "auth": {"password": "pw"}}),
            resource_type: Some("image".to_string()),
            resource_id: Some("nginx".to_string()),
            created_by: "admin".to_string(),
            retry_of: None,
        })
    }

    fn stores() -> Vec<Arc<dyn TaskStore>> {
        vec![
            Arc::new(MemoryTaskStore::new()),
            Arc::new(SqliteTaskStore::new(Storage::in_memory().unwrap())),
        ]
    }

    #[tokio::test]
    async fn test_create_get_roundtrip_keeps_params() {
        for store in stores() {
            let task = store.create(queued("image.pull")).await.unwrap();
            let loaded = store.get(&task.id).await.unwrap();
            assert_eq!(loaded.id, task.id);
            assert_eq!(loaded.params["auth"]["password"], "pw");
            assert_eq!(loaded.status, TaskStatus::Queued);
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        for store in stores() {
            let err = store.get(&TaskId::new()).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_transitions_follow_state_machine() {
        for store in stores() {
            let task = store.create(queued("image.pull")).await.unwrap();

            let err = store
                .transition(&task.id, Transition::succeed(json!({}), Utc::now()))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));

            let running = store
                .transition(&task.id, Transition::start(Utc::now()))
                .await
                .unwrap();
            assert_eq!(running.status, TaskStatus::Running);

            // A second claim loses
            assert!(store
                .transition(&task.id, Transition::start(Utc::now()))
                .await
                .is_err());

            let done = store
                .transition(&task.id, Transition::succeed(json!({"ok": true}), Utc::now()))
                .await
                .unwrap();
            assert_eq!(done.status, TaskStatus::Success);
            assert!(done.error.is_none());

            let loaded = store.get(&task.id).await.unwrap();
            assert_eq!(loaded.result, Some(json!({"ok": true})));
            assert!(loaded.started_at.unwrap() <= loaded.finished_at.unwrap());
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        for store in stores() {
            let task = store.create(queued("image.pull")).await.unwrap();

            let mut handles = Vec::new();
            for _ in 0..8 {
                let store = Arc::clone(&store);
                let id = task.id.clone();
                handles.push(tokio::spawn(async move {
                    store.transition(&id, Transition::start(Utc::now())).await.is_ok()
                }));
            }

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test]
    async fn test_list_newest_first_and_filters() {
        for store in stores() {
            let first = store.create(queued("image.pull")).await.unwrap();
            let second = store.create(queued("image.save")).await.unwrap();
            let third = store.create(queued("image.pull")).await.unwrap();

            let all = store.list(&TaskFilter::new()).await.unwrap();
            let ids: Vec<_> = all.iter().map(|t| t.id.clone()).collect();
            assert_eq!(ids, vec![third.id.clone(), second.id.clone(), first.id.clone()]);

            let pulls = store
                .list(&TaskFilter::new().with_task_type("image.pull").with_limit(1))
                .await
                .unwrap();
            assert_eq!(pulls.len(), 1);
            assert_eq!(pulls[0].id, third.id);

            let queued_ids = store.ids_with_status(TaskStatus::Queued).await.unwrap();
            assert_eq!(queued_ids, vec![first.id, second.id, third.id]);
            assert_eq!(store.count().await.unwrap(), 3);
        }
    }
}

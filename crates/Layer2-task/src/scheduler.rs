//! Scheduler - fixed worker pool over a FIFO queue
//!
//! Features:
//! - N workers share one queue; pops are atomic so a task is claimed once
//! - `queued -> running` is a guarded transition; losing it means skip
//! - Handlers run in their own Tokio task so panics become failures
//! - Startup recovery of interrupted and still-queued tasks
//! - Explicit `shutdown` / `drain`

use crate::log::{TaskLogSink, TaskLogger};
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::state::{TaskStatus, Transition};
use crate::store::TaskStore;
use crate::task::TaskId;
use chrono::Utc;
use harbor_foundation::{AuditAction, AuditEntry, AuditLogger, AuditStatus, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Error recorded for tasks found `running` at startup
pub const INTERRUPTED_ERROR: &str = "Task interrupted by restart";

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Optional queue bound; `None` means unbounded
    pub max_queued: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queued: None,
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub workers: usize,
    pub running: usize,
    pub queued: usize,
    pub accepting: bool,
}

/// What `recover` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks failed because they were running when the process stopped
    pub interrupted: Vec<TaskId>,
    /// Tasks put back on the queue
    pub requeued: Vec<TaskId>,
}

struct Queue {
    items: VecDeque<TaskId>,
    /// Popped but not yet finished
    in_flight: usize,
    /// Slots handed out by `reserve` and not yet submitted
    reserved: usize,
}

/// Room in the queue held for a task that is being persisted
pub struct QueueSlot {
    inner: Arc<Inner>,
    used: bool,
}

impl QueueSlot {
    /// Push the task into the reserved place
    pub fn submit(mut self, task_id: TaskId) {
        {
            let mut queue = self.inner.queue.lock();
            queue.reserved -= 1;
            queue.items.push_back(task_id.clone());
        }
        self.used = true;
        self.inner.work.notify_one();
        debug!(task_id = %task_id, "Task submitted");
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if !self.used {
            self.inner.queue.lock().reserved -= 1;
        }
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    logs: Arc<TaskLogSink>,
    audit: AuditLogger,
    config: SchedulerConfig,
    queue: Mutex<Queue>,
    work: Notify,
    idle: Notify,
    accepting: AtomicBool,
    running: AtomicUsize,
}

/// Worker pool handle, owned by the composition root
pub struct Scheduler {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        logs: Arc<TaskLogSink>,
        audit: AuditLogger,
    ) -> Self {
        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            store,
            registry,
            logs,
            audit,
            config: SchedulerConfig { workers, ..config },
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                in_flight: 0,
                reserved: 0,
            }),
            work: Notify::new(),
            idle: Notify::new(),
            accepting: AtomicBool::new(true),
            running: AtomicUsize::new(0),
        });

        let (stop, _) = watch::channel(false);
        let handles = (0..workers)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                let stop_rx = stop.subscribe();
                tokio::spawn(worker_loop(inner, worker_id, stop_rx))
            })
            .collect();

        info!(workers, max_queued = ?inner.config.max_queued, "Scheduler started");

        Self {
            inner,
            stop,
            handles: tokio::sync::Mutex::new(handles),
        }
    }

    /// Reserve room for one task, failing if the queue bound is reached or
    /// intake is closed. The slot counts against the bound until it is
    /// submitted or dropped.
    pub fn reserve(&self) -> Result<QueueSlot> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::Internal("Scheduler is shutting down".to_string()));
        }
        let mut queue = self.inner.queue.lock();
        if let Some(max) = self.inner.config.max_queued {
            let pending = queue.items.len() + queue.reserved;
            if pending >= max {
                return Err(Error::QueueFull(pending));
            }
        }
        queue.reserved += 1;
        Ok(QueueSlot {
            inner: Arc::clone(&self.inner),
            used: false,
        })
    }

    /// Hand a queued task to the pool
    pub fn submit(&self, task_id: TaskId) -> Result<()> {
        self.reserve()?.submit(task_id);
        Ok(())
    }

    /// Reconcile the store with an empty in-memory queue after a restart
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for id in self.inner.store.ids_with_status(TaskStatus::Running).await? {
            match self
                .inner
                .store
                .transition(&id, Transition::fail(INTERRUPTED_ERROR, Utc::now()))
                .await
            {
                Ok(_) => {
                    self.inner
                        .logs
                        .append(&id, &format!("# failed error={}", INTERRUPTED_ERROR))
                        .await;
                    self.inner.audit.log(
                        AuditEntry::new(AuditAction::TaskRecovered, "system")
                            .with_status(AuditStatus::Failed)
                            .with_resource("task", Some(id.to_string())),
                    );
                    report.interrupted.push(id);
                }
                Err(e) => warn!(task_id = %id, error = %e, "Failed to mark interrupted task"),
            }
        }

        let queued = self.inner.store.ids_with_status(TaskStatus::Queued).await?;
        {
            let mut queue = self.inner.queue.lock();
            for id in &queued {
                if !queue.items.contains(id) {
                    queue.items.push_back(id.clone());
                }
            }
        }
        for _ in 0..queued.len() {
            self.inner.work.notify_one();
        }
        report.requeued = queued;

        info!(
            interrupted = report.interrupted.len(),
            requeued = report.requeued.len(),
            "Scheduler recovery complete"
        );
        Ok(report)
    }

    pub fn stats(&self) -> SchedulerStats {
        let queued = self.inner.queue.lock().items.len();
        SchedulerStats {
            workers: self.inner.config.workers,
            running: self.inner.running.load(Ordering::SeqCst),
            queued,
            accepting: self.inner.accepting.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Wait until the queue is empty and no task is in flight
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            {
                let queue = self.inner.queue.lock();
                if queue.items.is_empty() && queue.in_flight == 0 {
                    return;
                }
            }
            // Timed wait covers a notification fired between the check and the await.
            let _ = tokio::time::timeout(Duration::from_millis(100), idle).await;
        }
    }

    /// Stop intake, finish everything queued, then stop workers
    pub async fn drain(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!("Draining scheduler");
        self.wait_idle().await;
        self.shutdown().await;
    }

    /// Stop intake and wait for running handlers. Queued tasks stay queued
    /// in the store and are picked up by `recover` on the next start.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let _ = self.stop.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker exited abnormally");
            }
        }

        let left = self.inner.queue.lock().items.len();
        info!(left_queued = left, "Scheduler stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize, mut stop: watch::Receiver<bool>) {
    debug!(worker_id, "Worker started");

    loop {
        if *stop.borrow() {
            break;
        }

        let next = {
            let mut queue = inner.queue.lock();
            let next = queue.items.pop_front();
            if next.is_some() {
                queue.in_flight += 1;
            }
            next
        };

        match next {
            Some(task_id) => {
                run_task(&inner, worker_id, task_id).await;
                inner.queue.lock().in_flight -= 1;
                inner.idle.notify_waiters();
            }
            None => {
                tokio::select! {
                    _ = inner.work.notified() => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

async fn run_task(inner: &Inner, worker_id: usize, task_id: TaskId) {
    // Claim
    let task = match inner
        .store
        .transition(&task_id, Transition::start(Utc::now()))
        .await
    {
        Ok(task) => task,
        Err(Error::InvalidTransition { from, .. }) => {
            debug!(task_id = %task_id, status = %from, "Task already claimed, skipping");
            return;
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to claim task");
            return;
        }
    };

    inner.running.fetch_add(1, Ordering::SeqCst);
    let started_at = task.started_at.unwrap_or_else(Utc::now);
    inner
        .logs
        .append(&task_id, &format!("# running started_at={}", started_at.to_rfc3339()))
        .await;
    info!(task_id = %task_id, task_type = %task.task_type, worker_id, "Executing task");

    let outcome = match inner.registry.resolve(&task.task_type) {
        Ok((kind, handler)) => {
            let ctx = HandlerContext {
                task_id: task_id.clone(),
                kind,
                log: TaskLogger::new(Arc::clone(&inner.logs), task_id.clone()),
            };
            let params = task.params.clone();
            let join = tokio::spawn(async move { handler.run(ctx, params).await });
            match join.await {
                Ok(result) => result,
                Err(e) => Err(Error::Handler(join_error_message(e))),
            }
        }
        Err(e) => Err(e),
    };

    let finished_at = Utc::now();
    let transition = match outcome {
        Ok(result) => {
            inner
                .logs
                .append(&task_id, &format!("# success finished_at={}", finished_at.to_rfc3339()))
                .await;
            Transition::succeed(normalize_result(result), finished_at)
        }
        Err(e) => {
            let message = e.to_string();
            inner
                .logs
                .append(&task_id, &format!("# failed error={}", message))
                .await;
            Transition::fail(message, finished_at)
        }
    };

    match inner.store.transition(&task_id, transition).await {
        Ok(done) => info!(
            task_id = %task_id,
            status = %done.status,
            duration_ms = done.duration().map(|d| d.num_milliseconds()).unwrap_or(0),
            "Task finished"
        ),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to record task outcome");
            debug_assert!(
                !matches!(e, Error::InvalidTransition { .. }),
                "worker lost ownership of a running task"
            );
        }
    }

    inner.running.fetch_sub(1, Ordering::SeqCst);
    inner.logs.release(&task_id);
}

/// Handlers may return any JSON; non-objects are wrapped so `result` stays an object
fn normalize_result(result: Value) -> Value {
    match result {
        Value::Object(_) => result,
        Value::Null => Value::Object(Default::default()),
        other => serde_json::json!({ "value": other }),
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("Handler panicked: {}", detail)
    } else {
        "Handler was cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use crate::store::MemoryTaskStore;
    use crate::task::{NewTask, Task, TaskKind};
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryTaskStore>,
        logs: Arc<TaskLogSink>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(TaskLogSink::new(dir.path()));
        Harness {
            _dir: dir,
            store: Arc::new(MemoryTaskStore::new()),
            logs,
        }
    }

    async fn queue_task(store: &MemoryTaskStore, task_type: &str) -> TaskId {
        let task = Task::queued(NewTask {
            task_type: task_type.to_string(),
            params: json!({}),
            resource_type: None,
            resource_id: None,
            created_by: "admin".to_string(),
            retry_of: None,
        });
        store.create(task).await.unwrap().id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_panic_becomes_failure() {
        let h = harness();
        let registry = HandlerRegistry::builder()
            .register(
                TaskKind::ImagePull,
                handler_fn(|_ctx, _params| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(json!({}))
                }),
            )
            .build();

        let scheduler = Scheduler::start(
            SchedulerConfig::default(),
            h.store.clone(),
            Arc::new(registry),
            h.logs.clone(),
            AuditLogger::tracing_only(),
        );

        let id = queue_task(&h.store, "image.pull").await;
        scheduler.submit(id.clone()).unwrap();
        scheduler.drain().await;

        let task = h.store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_at_run_time() {
        let h = harness();
        let scheduler = Scheduler::start(
            SchedulerConfig::default(),
            h.store.clone(),
            Arc::new(HandlerRegistry::builder().build()),
            h.logs.clone(),
            AuditLogger::tracing_only(),
        );

        let id = queue_task(&h.store, "image.save").await;
        scheduler.submit(id.clone()).unwrap();
        scheduler.drain().await;

        let task = h.store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("not registered"));
        let log = h.logs.tail(&id, 10).await.unwrap();
        assert!(log.contains("# running started_at="));
        assert!(log.contains("# failed error="));
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let h = harness();
        let scheduler = Scheduler::start(
            SchedulerConfig {
                workers: 1,
                max_queued: Some(1),
            },
            h.store.clone(),
            Arc::new(HandlerRegistry::builder().build()),
            h.logs.clone(),
            AuditLogger::tracing_only(),
        );
        // Stop workers so nothing is dequeued
        scheduler.shutdown().await;
        assert!(scheduler.submit(TaskId::new()).is_err());
        assert!(!scheduler.stats().accepting);
    }

    #[tokio::test]
    async fn test_reserved_slots_count_against_bound() {
        let h = harness();
        let scheduler = Scheduler::start(
            SchedulerConfig {
                workers: 1,
                max_queued: Some(1),
            },
            h.store.clone(),
            Arc::new(HandlerRegistry::builder().build()),
            h.logs.clone(),
            AuditLogger::tracing_only(),
        );

        let slot = scheduler.reserve().unwrap();
        assert!(matches!(scheduler.reserve(), Err(Error::QueueFull(1))));
        drop(slot);

        let id = queue_task(&h.store, "image.pull").await;
        scheduler.reserve().unwrap().submit(id.clone());
        scheduler.drain().await;
        assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_fails_running_and_requeues_queued() {
        let h = harness();

        let interrupted = queue_task(&h.store, "image.pull").await;
        h.store
            .transition(&interrupted, Transition::start(Utc::now()))
            .await
            .unwrap();
        let waiting = queue_task(&h.store, "image.pull").await;

        let registry = HandlerRegistry::builder()
            .register(
                TaskKind::ImagePull,
                handler_fn(|_ctx, _params| async move { Ok(json!({"pulled": true})) }),
            )
            .build();
        let scheduler = Scheduler::start(
            SchedulerConfig::default(),
            h.store.clone(),
            Arc::new(registry),
            h.logs.clone(),
            AuditLogger::tracing_only(),
        );

        let report = scheduler.recover().await.unwrap();
        assert_eq!(report.interrupted, vec![interrupted.clone()]);
        assert_eq!(report.requeued, vec![waiting.clone()]);

        scheduler.drain().await;

        let failed = h.store.get(&interrupted).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(INTERRUPTED_ERROR));

        let done = h.store.get(&waiting).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result, Some(json!({"pulled": true})));
    }

    #[test]
    fn test_normalize_result() {
        assert_eq!(normalize_result(json!(null)), json!({}));
        assert_eq!(normalize_result(json!([1])), json!({"value": [1]}));
        assert_eq!(normalize_result(json!({"a": 1})), json!({"a": 1}));
    }
}

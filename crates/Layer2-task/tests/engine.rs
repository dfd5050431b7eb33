//! Engine integration tests - service, scheduler, store and handlers wired together
//!
//! `cargo test -p harbor-task --test engine`

use async_trait::async_trait;
use harbor_foundation::{AuditLogger, Confirmation, Error, Result, Storage};
use harbor_task::process::CommandOutput;
use harbor_task::{
    handler_fn, register_default_handlers, BuildOutcome, BuildRequest, ComposeInvocation,
    ContainerRuntime, EnqueueRequest, HandlerDeps, HandlerRegistry, LogsQuery, PullOutcome,
    PullRequest, Scheduler, SchedulerConfig, SqliteTaskStore, Task, TaskFilter, TaskKind,
    TaskLogSink, TaskLogger, TaskService, TaskStatus, TaskStore, Workspaces, INTERRUPTED_ERROR,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// Fixtures
// ============================================================================

/// Records calls instead of talking to an engine
#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<String>>,
}

impl RecordingRuntime {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn pull_image(&self, request: &PullRequest, log: &TaskLogger) -> Result<PullOutcome> {
        self.record(format!("pull {}", request.target()));
        log.line(format!("{}: Pulling from library", request.target())).await;
        log.line("Status: Downloaded newer image").await;
        Ok(PullOutcome {
            target: request.target(),
            events: vec![json!({"status": "Downloaded newer image"})],
        })
    }

    async fn build_image(&self, request: &BuildRequest, _log: &TaskLogger) -> Result<BuildOutcome> {
        self.record(format!("build {}", request.tag));
        Ok(BuildOutcome {
            tag: request.tag.clone(),
            events: Vec::new(),
        })
    }

    async fn load_image(&self, archive: &Path, _log: &TaskLogger) -> Result<Vec<String>> {
        self.record(format!("load {}", archive.display()));
        Ok(Vec::new())
    }

    async fn save_image(&self, image: &str, output: &Path, _log: &TaskLogger) -> Result<u64> {
        self.record(format!("save {}", image));
        tokio::fs::write(output, b"layers").await?;
        Ok(6)
    }

    async fn remove_image(&self, image: &str, _force: bool, _noprune: bool) -> Result<Value> {
        self.record(format!("rmi {}", image));
        Ok(json!([]))
    }

    async fn container_logs(&self, container_id: &str, _query: &LogsQuery) -> Result<String> {
        self.record(format!("logs {}", container_id));
        Ok(String::new())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.record(format!("rm {}", container_id));
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("kill {}", container_id));
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("stop {}", container_id));
        Ok(())
    }

    async fn compose(&self, invocation: &ComposeInvocation, _log: &TaskLogger) -> Result<CommandOutput> {
        self.record(format!("compose {}", invocation.project_name));
        Ok(CommandOutput {
            exit_code: 0,
            lines: Vec::new(),
        })
    }
}

struct Engine {
    dir: tempfile::TempDir,
    storage: Storage,
    store: Arc<SqliteTaskStore>,
    runtime: Arc<RecordingRuntime>,
    service: TaskService,
}

impl Engine {
    fn export_dir(&self) -> PathBuf {
        self.dir.path().join("exports")
    }

    fn workspaces(&self) -> Workspaces {
        Workspaces::new(self.dir.path().join("workspaces"))
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.service.scheduler().wait_idle())
            .await
            .expect("engine did not go idle");
    }
}

fn engine_with(registry: impl FnOnce(Arc<HandlerDeps>) -> HandlerRegistry, workers: usize) -> Engine {
    engine_with_config(
        registry,
        SchedulerConfig {
            workers,
            max_queued: None,
        },
    )
}

fn engine_with_config(
    registry: impl FnOnce(Arc<HandlerDeps>) -> HandlerRegistry,
    config: SchedulerConfig,
) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for sub in ["workspaces", "stacks", "exports", "uploads"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }

    let storage = Storage::open(&root.join("harbor.db")).unwrap();
    let store = Arc::new(SqliteTaskStore::new(storage.clone()));
    let logs = Arc::new(TaskLogSink::new(root.join("logs")));
    let audit = AuditLogger::new(storage.clone());
    let runtime = Arc::new(RecordingRuntime::default());

    let deps = Arc::new(HandlerDeps {
        runtime: runtime.clone(),
        workspaces: Workspaces::new(root.join("workspaces")),
        stacks_dir: root.join("stacks"),
        export_dir: root.join("exports"),
        upload_dir: root.join("uploads"),
        max_download_bytes: 1024 * 1024,
        http: reqwest::Client::new(),
        proxy: None,
    });
    let registry = Arc::new(registry(deps));
    let scheduler = Arc::new(Scheduler::start(
        config,
        store.clone(),
        registry.clone(),
        logs.clone(),
        audit.clone(),
    ));
    let service = TaskService::new(
        store.clone(),
        registry,
        scheduler,
        logs,
        audit,
        vec![root.join("exports"), root.join("uploads")],
    );

    Engine {
        dir,
        storage,
        store,
        runtime,
        service,
    }
}

fn engine() -> Engine {
    engine_with(
        |deps| register_default_handlers(HandlerRegistry::builder(), deps).build(),
        4,
    )
}

/// `image.pull` handler that blocks until the test hands out a permit
fn gated_pull(gate: Arc<Semaphore>) -> impl FnOnce(Arc<HandlerDeps>) -> HandlerRegistry {
    move |_deps| {
        HandlerRegistry::builder()
            .register(
                TaskKind::ImagePull,
                handler_fn(move |_ctx, params: Value| {
                    let gate = gate.clone();
                    async move {
                        match gate.acquire().await {
                            Ok(permit) => permit.forget(),
                            Err(e) => return Err(Error::handler(e.to_string())),
                        }
                        Ok(params)
                    }
                }),
            )
            .build()
    }
}

async fn running_rows(engine: &Engine) -> Vec<Task> {
    engine
        .store
        .list(&TaskFilter {
            status: Some(TaskStatus::Running),
            ..TaskFilter::default()
        })
        .await
        .unwrap()
}

/// Poll until exactly `n` rows are running
async fn wait_running(engine: &Engine, n: usize) -> Vec<Task> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let rows = running_rows(engine).await;
            if rows.len() == n {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks did not start")
}

fn pull(image: &str) -> EnqueueRequest {
    EnqueueRequest::new("image.pull", json!({ "image": image }), "alice")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_pull_image_end_to_end() {
    let engine = engine();
    let id = engine
        .service
        .enqueue(EnqueueRequest::new(
            "image.pull",
            json!({"image": "nginx", "tag": "1.25"}),
            "alice",
        ))
        .await
        .unwrap();
    engine.settle().await;

    let view = engine.service.get(&id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Success);
    assert_eq!(view.resource_type.as_deref(), Some("image"));
    assert_eq!(view.resource_id.as_deref(), Some("nginx:1.25"));
    assert_eq!(view.result.as_ref().unwrap()["target"], "nginx:1.25");
    assert!(view.error.is_none());
    assert!(view.started_at.unwrap() <= view.finished_at.unwrap());

    let log = engine.service.logs(&id, None).await.unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert!(lines[0].starts_with("# queued task_type=image.pull created_by=alice"));
    assert!(lines[1].starts_with("# running started_at="));
    assert!(log.contains("Status: Downloaded newer image"));
    assert!(lines.last().unwrap().starts_with("# success finished_at="));

    assert_eq!(*engine.runtime.calls.lock(), vec!["pull nginx:1.25"]);
}

#[tokio::test]
async fn test_delete_workspace_requires_confirmation() {
    let engine = engine();
    let workspaces = engine.workspaces();
    let workspace_id = Workspaces::new_id();
    std::fs::create_dir_all(workspaces.path_for(&workspace_id).unwrap()).unwrap();

    let request = EnqueueRequest::new(
        "image.git.workspace.delete",
        json!({"workspace_id": workspace_id}),
        "alice",
    );
    let before = engine.store.count().await.unwrap();
    let err = engine.service.enqueue(request.clone()).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationMissing { .. }));
    assert_eq!(engine.store.count().await.unwrap(), before);

    let audit = engine.storage.recent_audit(10).unwrap();
    assert!(audit
        .iter()
        .any(|r| r.action == "task.confirmation_rejected" && r.status == "denied"));

    let id = engine
        .service
        .enqueue(request.confirmed(Confirmation::confirmed()))
        .await
        .unwrap();
    engine.settle().await;

    let view = engine.service.get(&id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Success);
    assert_eq!(view.result.unwrap()["deleted"], true);
    assert!(workspaces.path(&workspace_id).is_err());
}

#[tokio::test]
async fn test_retry_of_failed_save_then_download() {
    let engine = engine();

    // Missing filename fails validation inside the handler
    let failed = engine
        .service
        .enqueue(EnqueueRequest::new("image.save", json!({"image": "nginx"}), "alice"))
        .await
        .unwrap();
    engine.settle().await;
    let view = engine.service.get(&failed).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.error.unwrap().contains("Invalid params"));
    assert!(matches!(
        engine.service.download(&failed).await,
        Err(Error::NotReady(_))
    ));

    let mut overrides = serde_json::Map::new();
    overrides.insert("filename".to_string(), json!("nginx.tar"));
    let outcome = engine
        .service
        .retry(&failed, "bob", Some(overrides), &Confirmation::none())
        .await
        .unwrap();
    engine.settle().await;

    let retried = engine.service.get(&outcome.new_task_id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Success);
    assert_eq!(retried.retry_of.as_ref(), Some(&failed));

    let download = engine.service.download(&outcome.new_task_id).await.unwrap();
    assert_eq!(download.filename, "nginx.tar");
    assert_eq!(download.size, 6);
    assert!(download.path.starts_with(engine.export_dir().canonicalize().unwrap()));

    // Original is untouched and a successful task cannot be retried
    assert_eq!(
        engine.service.get(&failed).await.unwrap().status,
        TaskStatus::Failed
    );
    assert!(matches!(
        engine
            .service
            .retry(&outcome.new_task_id, "bob", None, &Confirmation::none())
            .await,
        Err(Error::NotRetryable { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bounds_running_rows() {
    const WORKERS: usize = 2;
    const TASKS: usize = 6;

    let gate = Arc::new(Semaphore::new(0));
    let engine = engine_with(gated_pull(gate.clone()), WORKERS);

    let mut ids = Vec::new();
    for i in 0..TASKS {
        ids.push(engine.service.enqueue(pull(&format!("img{}", i))).await.unwrap());
    }

    // Held handlers: their rows are running with no outcome yet
    for task in wait_running(&engine, WORKERS).await {
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_none());
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }
    let first = engine.store.get(&ids[0]).await.unwrap();
    assert_eq!(first.status, TaskStatus::Running);

    // Release one at a time; the pool never runs more than its size
    for _ in 0..TASKS {
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(running_rows(&engine).await.len() <= WORKERS);
    }
    engine.settle().await;

    for id in ids {
        let task = engine.store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.result.is_some());
        assert!(task.error.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_bound_holds_under_concurrent_enqueue() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = engine_with_config(
        gated_pull(gate.clone()),
        SchedulerConfig {
            workers: 1,
            max_queued: Some(1),
        },
    );

    let busy = engine.service.enqueue(pull("busy")).await.unwrap();
    wait_running(&engine, 1).await;

    let (a, b) = tokio::join!(
        engine.service.enqueue(pull("a")),
        engine.service.enqueue(pull("b")),
    );
    let accepted: Vec<_> = [a, b]
        .into_iter()
        .filter_map(|r| match r {
            Ok(id) => Some(id),
            Err(e) => {
                assert!(matches!(e, Error::QueueFull(_)), "unexpected error: {}", e);
                None
            }
        })
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(engine.store.count().await.unwrap(), 2);

    gate.add_permits(2);
    engine.settle().await;

    for id in std::iter::once(busy).chain(accepted) {
        assert_eq!(
            engine.store.get(&id).await.unwrap().status,
            TaskStatus::Success
        );
    }
    assert_eq!(engine.service.scheduler().stats().queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_handler_is_recorded_as_failed() {
    let engine = engine_with(
        |_deps| {
            HandlerRegistry::builder()
                .register(
                    TaskKind::ContainerKill,
                    handler_fn(|_ctx, params: Value| async move {
                        if params.get("container_id").is_some() {
                            panic!("engine went away");
                        }
                        Ok(params)
                    }),
                )
                .build()
        },
        1,
    );

    let id = engine
        .service
        .enqueue(
            EnqueueRequest::new("container.kill", json!({"container_id": "abc"}), "alice")
                .confirmed(Confirmation::new(false, Some("yes".to_string()))),
        )
        .await
        .unwrap();
    engine.settle().await;

    let task = engine.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("engine went away"));
    assert!(task.result.is_none());
}

#[tokio::test]
async fn test_restart_recovers_interrupted_and_queued_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("harbor.db");

    // First process: one task claimed, one still waiting, then the process dies
    let (interrupted, waiting) = {
        let store = SqliteTaskStore::new(Storage::open(&db).unwrap());
        let new = |image: &str| harbor_task::Task::queued(harbor_task::NewTask {
            task_type: "image.pull".to_string(),
            params: json!({"image": image}),
            resource_type: Some("image".to_string()),
            resource_id: Some(image.to_string()),
            created_by: "alice".to_string(),
            retry_of: None,
        });
        let a = store.create(new("a")).await.unwrap().id;
        let b = store.create(new("b")).await.unwrap().id;
        store
            .transition(&a, harbor_task::Transition::start(chrono::Utc::now()))
            .await
            .unwrap();
        (a, b)
    };

    // Second process
    let store = Arc::new(SqliteTaskStore::new(Storage::open(&db).unwrap()));
    let registry = HandlerRegistry::builder()
        .register(
            TaskKind::ImagePull,
            handler_fn(|_ctx, _params| async move { Ok(json!({"pulled": true})) }),
        )
        .build();
    let scheduler = Scheduler::start(
        SchedulerConfig::default(),
        store.clone(),
        Arc::new(registry),
        Arc::new(TaskLogSink::new(dir.path().join("logs"))),
        AuditLogger::tracing_only(),
    );
    let report = scheduler.recover().await.unwrap();
    assert_eq!(report.interrupted, vec![interrupted.clone()]);
    assert_eq!(report.requeued, vec![waiting.clone()]);
    scheduler.drain().await;

    let failed = store.get(&interrupted).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(INTERRUPTED_ERROR));
    assert_eq!(
        store.get(&waiting).await.unwrap().status,
        TaskStatus::Success
    );
}

//! # harbor-task
//!
//! Task orchestration engine for Harbor.
//! Accepts long-running container operations, runs them on a bounded worker
//! pool and keeps a durable record and log of every run.
//!
//! ## Features
//!
//! - Durable task records with guarded `queued -> running -> success|failed` transitions
//! - Confirmation Gate for destructive operations
//! - Immutable handler registry over a closed set of task kinds
//! - Per-task log files with bounded tail reads
//! - Fixed worker pool with startup recovery and explicit shutdown
//! - **Built-in handlers for images, git workspaces, compose stacks and containers**
//! - Optional outbound proxy for git, compose and URL downloads

pub mod handlers;
pub mod log;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod task;
pub mod workspace;

// Task model
pub use state::{TaskStatus, Transition};
pub use task::{NewTask, Task, TaskId, TaskKind};

// Persistence
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskFilter, TaskStore};

// Log system
pub use log::{TaskLogSink, TaskLogger, DEFAULT_LOG_TAIL_LINES, MAX_LOG_TAIL_LINES};

// Handlers
pub use handlers::{register_default_handlers, ComposeAction, HandlerDeps};
pub use registry::{handler_fn, HandlerContext, HandlerRegistry, RegistryBuilder, TaskHandler};

// Execution
pub use scheduler::{
    QueueSlot, RecoveryReport, Scheduler, SchedulerConfig, SchedulerStats, INTERRUPTED_ERROR,
};
pub use service::{
    EnqueueRequest, ListQuery, RetryOutcome, TaskDownload, TaskService, TaskView,
    DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};

// Container runtime
pub use runtime::{
    BuildContext, BuildOutcome, BuildRequest, ComposeInvocation, ContainerRuntime, DockerRuntime,
    LogsQuery, PullOutcome, PullRequest, RegistryAuth,
};
pub use workspace::{WorkspaceListing, WorkspaceMeta, Workspaces};

// Network
pub use proxy::{http_client, ProxyUrl};

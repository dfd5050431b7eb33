//! Built-in task handlers
//!
//! One async function per [`TaskKind`], grouped by resource family:
//! - `image`: pull, build, load, save, remove
//! - `git`: workspace clone / sync / build / delete, override clear
//! - `compose`: stack and workspace compose actions
//! - `container`: log export, remove, kill, batch stop

mod compose;
mod container;
mod git;
mod image;

pub use compose::ComposeAction;

use crate::process::CommandSpec;
use crate::proxy::ProxyUrl;
use crate::registry::{handler_fn, RegistryBuilder};
use crate::runtime::ContainerRuntime;
use crate::task::TaskKind;
use crate::workspace::Workspaces;
use harbor_foundation::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Git operations deadline
pub const GIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Compose operations deadline
pub const COMPOSE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// URL download deadline
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything the handlers reach into
pub struct HandlerDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub workspaces: Workspaces,
    pub stacks_dir: PathBuf,
    pub export_dir: PathBuf,
    pub upload_dir: PathBuf,
    /// Upper bound for `image.load.url` downloads
    pub max_download_bytes: u64,
    pub http: reqwest::Client,
    /// Outbound proxy for git, compose and downloads
    pub proxy: Option<ProxyUrl>,
}

impl HandlerDeps {
    /// Child process spec with the proxy variables set
    pub(crate) fn proxied(&self, spec: CommandSpec) -> CommandSpec {
        match &self.proxy {
            Some(proxy) => proxy.apply(spec),
            None => spec,
        }
    }

    pub(crate) fn proxy_env(&self) -> Vec<(String, String)> {
        self.proxy.as_ref().map(ProxyUrl::env).unwrap_or_default()
    }
}

macro_rules! register_all {
    ($builder:expr, $deps:expr, { $($kind:ident => $func:path),+ $(,)? }) => {{
        let mut builder = $builder;
        $(
            let deps = Arc::clone(&$deps);
            builder = builder.register(
                TaskKind::$kind,
                handler_fn(move |ctx, params| {
                    let deps = Arc::clone(&deps);
                    async move { $func(&deps, ctx, params).await }
                }),
            );
        )+
        builder
    }};
}

/// Register a handler for every [`TaskKind`]
pub fn register_default_handlers(builder: RegistryBuilder, deps: Arc<HandlerDeps>) -> RegistryBuilder {
    register_all!(builder, deps, {
        ImagePull => image::pull,
        ImageBuild => image::build,
        ImageBuildUpload => image::build_upload,
        ImageLoad => image::load,
        ImageLoadUrl => image::load_url,
        ImageSave => image::save,
        ImageRemove => image::remove,
        GitClone => git::clone,
        GitSync => git::sync,
        GitBuild => git::build,
        GitComposeAction => compose::workspace_action,
        GitWorkspaceDelete => git::delete_workspace,
        GitComposeOverrideClear => git::clear_override,
        StackAction => compose::stack_action,
        ContainerLogsExport => container::export_logs,
        ContainerRemove => container::remove,
        ContainerKill => container::kill,
        ContainerBatchStop => container::batch_stop,
    })
}

pub(crate) fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// Typed params; shape errors become `InvalidInput`
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::InvalidInput(format!("Invalid params: {}", e)))
}

/// Final path component of a user-supplied file name
pub(crate) fn base_name(filename: &str) -> Result<String> {
    Path::new(filename.trim())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .ok_or_else(|| Error::InvalidInput(format!("Invalid filename: {:?}", filename)))
}

/// Canonical `path`, which must exist and lie under `dir`
pub(crate) fn ensure_within(dir: &Path, path: &Path) -> Result<PathBuf> {
    let root = dir
        .canonicalize()
        .map_err(|e| Error::Internal(format!("Cannot resolve {}: {}", dir.display(), e)))?;
    let target = path
        .canonicalize()
        .map_err(|_| Error::NotFound(format!("File not found: {}", path.display())))?;
    if !target.starts_with(&root) {
        return Err(Error::Forbidden(format!(
            "{} is outside {}",
            path.display(),
            dir.display()
        )));
    }
    Ok(target)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::log::{TaskLogSink, TaskLogger};
    use crate::registry::HandlerContext;
    use crate::runtime::fake::FakeRuntime;
    use crate::task::TaskId;

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub runtime: Arc<FakeRuntime>,
        pub deps: HandlerDeps,
        pub sink: Arc<TaskLogSink>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            for sub in ["workspaces", "stacks", "exports", "uploads", "logs"] {
                std::fs::create_dir_all(root.join(sub)).unwrap();
            }
            let runtime = Arc::new(FakeRuntime::default());
            let deps = HandlerDeps {
                runtime: runtime.clone(),
                workspaces: Workspaces::new(root.join("workspaces")),
                stacks_dir: root.join("stacks"),
                export_dir: root.join("exports"),
                upload_dir: root.join("uploads"),
                max_download_bytes: 1024,
                http: reqwest::Client::new(),
                proxy: None,
            };
            let sink = Arc::new(TaskLogSink::new(root.join("logs")));
            Self {
                dir,
                runtime,
                deps,
                sink,
            }
        }

        pub fn with_proxy(mut self, proxy: &str) -> Self {
            self.deps.proxy = ProxyUrl::parse(proxy).unwrap();
            self
        }

        pub fn ctx(&self, kind: TaskKind) -> HandlerContext {
            let task_id = TaskId::new();
            HandlerContext {
                task_id: task_id.clone(),
                kind,
                log: TaskLogger::new(Arc::clone(&self.sink), task_id),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.runtime.calls.lock().clone()
        }
    }
}

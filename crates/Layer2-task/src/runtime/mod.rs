//! Container runtime driver
//!
//! Handlers talk to the host's container engine only through
//! [`ContainerRuntime`], so the engine can run against a fake in tests.

mod docker;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use crate::log::TaskLogger;
use crate::process::CommandOutput;
use async_trait::async_trait;
use harbor_foundation::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Registry credentials for a pull
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub serveraddress: Option<String>,
    #[serde(default)]
    pub identitytoken: Option<String>,
}

/// Image pull
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub image: String,
    pub tag: Option<String>,
    pub auth: Option<RegistryAuth>,
}

impl PullRequest {
    /// `image:tag`, or `image` as given when no tag
    pub fn target(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.image, tag),
            None => self.image.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullOutcome {
    pub target: String,
    /// Last progress events reported by the engine
    pub events: Vec<Value>,
}

/// Where a build context comes from
#[derive(Debug, Clone, PartialEq)]
pub enum BuildContext {
    /// Directory on the host
    Path(PathBuf),
    /// Remote git repository understood by the engine
    GitUrl(String),
    /// Tar (optionally gzipped) archive
    Archive(PathBuf),
}

/// Image build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub context: BuildContext,
    pub dockerfile: String,
    pub no_cache: bool,
    pub pull: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildOutcome {
    pub tag: String,
    /// Last lines of build output
    pub events: Vec<String>,
}

/// Container log query
#[derive(Debug, Clone, Default)]
pub struct LogsQuery {
    /// Number of lines from the end; `None` means all
    pub tail: Option<u64>,
    /// Unix seconds
    pub since: Option<i64>,
    /// Unix seconds
    pub until: Option<i64>,
    pub timestamps: bool,
}

/// One `docker compose` run
#[derive(Debug, Clone)]
pub struct ComposeInvocation {
    pub project_name: String,
    pub compose_file: PathBuf,
    pub project_directory: Option<PathBuf>,
    pub env_files: Vec<PathBuf>,
    /// Sub-command and its flags, e.g. `["up", "-d"]`
    pub args: Vec<String>,
    /// Extra environment for the child, e.g. proxy variables
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Operations the handlers need from the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, request: &PullRequest, log: &TaskLogger) -> Result<PullOutcome>;

    async fn build_image(&self, request: &BuildRequest, log: &TaskLogger) -> Result<BuildOutcome>;

    /// Load an image archive; returns the loaded references
    async fn load_image(&self, archive: &Path, log: &TaskLogger) -> Result<Vec<String>>;

    /// Save an image to `output`; returns the file size
    async fn save_image(&self, image: &str, output: &Path, log: &TaskLogger) -> Result<u64>;

    async fn remove_image(&self, image: &str, force: bool, noprune: bool) -> Result<Value>;

    async fn container_logs(&self, container_id: &str, query: &LogsQuery) -> Result<String>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    async fn kill_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn compose(&self, invocation: &ComposeInvocation, log: &TaskLogger) -> Result<CommandOutput>;
}

//! In-memory runtime for handler tests

use super::{
    BuildOutcome, BuildRequest, ComposeInvocation, ContainerRuntime, LogsQuery, PullOutcome,
    PullRequest,
};
use crate::log::TaskLogger;
use crate::process::CommandOutput;
use async_trait::async_trait;
use harbor_foundation::{Error, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;

#[derive(Default)]
pub(crate) struct FakeRuntime {
    /// Every call as `op arg`
    pub calls: Mutex<Vec<String>>,
    /// Container ids that fail every operation
    pub broken: Mutex<HashSet<String>>,
    pub logs: Mutex<String>,
    pub last_compose: Mutex<Option<ComposeInvocation>>,
}

impl FakeRuntime {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn check(&self, container_id: &str) -> Result<()> {
        if self.broken.lock().contains(container_id) {
            return Err(Error::NotFound(format!("No such container: {}", container_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, request: &PullRequest, log: &TaskLogger) -> Result<PullOutcome> {
        self.record(format!("pull {}", request.target()));
        log.line("Pull complete").await;
        Ok(PullOutcome {
            target: request.target(),
            events: vec![json!({"status": "Pull complete"})],
        })
    }

    async fn build_image(&self, request: &BuildRequest, _log: &TaskLogger) -> Result<BuildOutcome> {
        self.record(format!("build {} {:?}", request.tag, request.context));
        Ok(BuildOutcome {
            tag: request.tag.clone(),
            events: vec!["Successfully built".to_string()],
        })
    }

    async fn load_image(&self, archive: &Path, _log: &TaskLogger) -> Result<Vec<String>> {
        let exists = archive.is_file();
        self.record(format!("load {} exists={}", archive.display(), exists));
        Ok(vec!["app:1.0".to_string()])
    }

    async fn save_image(&self, image: &str, output: &Path, _log: &TaskLogger) -> Result<u64> {
        self.record(format!("save {}", image));
        tokio::fs::write(output, b"image-bytes").await?;
        Ok(11)
    }

    async fn remove_image(&self, image: &str, force: bool, _noprune: bool) -> Result<Value> {
        self.record(format!("rmi {} force={}", image, force));
        Ok(json!([{"Untagged": image}]))
    }

    async fn container_logs(&self, container_id: &str, query: &LogsQuery) -> Result<String> {
        self.check(container_id)?;
        self.record(format!("logs {} tail={:?}", container_id, query.tail));
        Ok(self.logs.lock().clone())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.check(container_id)?;
        self.record(format!("rm {} force={}", container_id, force));
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        self.check(container_id)?;
        self.record(format!("kill {}", container_id));
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.check(container_id)?;
        self.record(format!("stop {}", container_id));
        Ok(())
    }

    async fn compose(&self, invocation: &ComposeInvocation, _log: &TaskLogger) -> Result<CommandOutput> {
        self.record(format!(
            "compose {} {}",
            invocation.project_name,
            invocation.args.join(" ")
        ));
        *self.last_compose.lock() = Some(invocation.clone());
        Ok(CommandOutput {
            exit_code: 0,
            lines: vec!["done".to_string()],
        })
    }
}

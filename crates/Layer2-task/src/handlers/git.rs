//! Workspace handlers backed by the `git` CLI

use super::{parse_params, HandlerDeps, GIT_TIMEOUT};
use crate::log::TaskLogger;
use crate::process::{run_streaming, CommandSpec};
use crate::registry::HandlerContext;
use crate::runtime::{BuildContext, BuildRequest};
use harbor_foundation::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const REV_PARSE_TIMEOUT: Duration = Duration::from_secs(60);

fn git() -> CommandSpec {
    CommandSpec::new("git").env("GIT_TERMINAL_PROMPT", "0")
}

/// Embed a personal access token into an HTTP(S) clone URL
fn inject_token(repo_url: &str, token: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(repo_url)
        .map_err(|e| Error::InvalidInput(format!("Invalid repo_url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidInput(
            "A token can only be used with http(s) repository URLs".to_string(),
        ));
    }
    url.set_username("x-token")
        .and_then(|_| url.set_password(Some(token)))
        .map_err(|_| Error::InvalidInput("repo_url cannot carry credentials".to_string()))?;
    Ok(url.to_string())
}

/// Errors may quote process output, which can echo the token
fn masked(log: &TaskLogger, err: Error) -> Error {
    match err {
        Error::Timeout(msg) => Error::Timeout(log.mask(&msg)),
        other => Error::Handler(log.mask(&other.to_string())),
    }
}

/// `--` keeps a URL starting with `-` from being read as an option
fn clone_command(
    deps: &HandlerDeps,
    branch: Option<&str>,
    url: String,
    target: &Path,
) -> CommandSpec {
    let mut spec = git().args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        spec = spec.args(["--branch", branch]);
    }
    let spec = spec
        .arg("--progress")
        .arg("--")
        .arg(url)
        .arg(target.to_string_lossy().to_string())
        .timeout(GIT_TIMEOUT);
    deps.proxied(spec)
}

#[derive(Debug, Deserialize)]
struct CloneParams {
    repo_url: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub(super) async fn clone(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: CloneParams = parse_params(params)?;
    let token = p.token.filter(|t| !t.is_empty());
    let (log, clone_url) = match &token {
        Some(token) => (
            ctx.log.with_secret(token.clone()),
            inject_token(&p.repo_url, token)?,
        ),
        None => (ctx.log.clone(), p.repo_url.clone()),
    };

    let workspaces = &deps.workspaces;
    let workspace_id = crate::workspace::Workspaces::new_id();
    let path = workspaces.path_for(&workspace_id)?;
    tokio::fs::create_dir_all(workspaces.root()).await?;

    let spec = clone_command(deps, p.branch.as_deref(), clone_url, &path);

    let cloned = match run_streaming(&spec, Some(&log)).await {
        Ok(output) => output.ensure_success("git clone"),
        Err(e) => Err(e),
    };
    if let Err(e) = cloned {
        if let Err(cleanup) = workspaces.remove(&workspace_id) {
            warn!(workspace_id = %workspace_id, error = %cleanup, "Failed to remove partial clone");
        }
        return Err(masked(&log, e));
    }

    workspaces.write_meta(&workspace_id, &p.repo_url, p.branch.as_deref())?;
    let listing = workspaces.describe(&workspace_id)?;
    info!(workspace_id = %workspace_id, repo_url = %p.repo_url, "Workspace cloned");

    let mut result = serde_json::to_value(listing)?;
    if let Value::Object(map) = &mut result {
        map.insert(
            "workspace_path".to_string(),
            Value::String(path.to_string_lossy().to_string()),
        );
    }
    Ok(result)
}

#[derive(Debug, Deserialize)]
struct WorkspaceParams {
    workspace_id: String,
}

pub(super) async fn sync(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: WorkspaceParams = parse_params(params)?;
    let path = deps.workspaces.path(&p.workspace_id)?;
    let dir = path.to_string_lossy().to_string();

    let pull = deps.proxied(
        git()
            .args(["-C", dir.as_str(), "pull", "--ff-only"])
            .timeout(GIT_TIMEOUT),
    );
    let output = run_streaming(&pull, Some(&ctx.log))
        .await?
        .ensure_success("git pull")?;

    let branch = git()
        .args(["-C", dir.as_str(), "rev-parse", "--abbrev-ref", "HEAD"])
        .timeout(REV_PARSE_TIMEOUT);
    let commit = git()
        .args(["-C", dir.as_str(), "rev-parse", "HEAD"])
        .timeout(REV_PARSE_TIMEOUT);
    let branch = crate::process::capture(&branch).await?.tail(1);
    let commit = crate::process::capture(&commit).await?.tail(1);

    let mut summary = output.tail(20);
    if summary.is_empty() {
        summary = "Already up to date.".to_string();
    }
    Ok(json!({
        "workspace_id": p.workspace_id,
        "branch": branch.trim(),
        "commit": commit.trim(),
        "output": summary,
    }))
}

fn default_context() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct GitBuildParams {
    workspace_id: String,
    tag: String,
    #[serde(default = "default_context")]
    context_path: String,
    #[serde(default = "super::default_dockerfile")]
    dockerfile: String,
    #[serde(default)]
    no_cache: bool,
    #[serde(default)]
    pull: bool,
    #[serde(default = "default_true")]
    cleanup_after: bool,
}

pub(super) async fn build(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: GitBuildParams = parse_params(params)?;

    let built = async {
        let context = deps.workspaces.resolve_file(&p.workspace_id, &p.context_path)?;
        deps.runtime
            .build_image(
                &BuildRequest {
                    tag: p.tag.clone(),
                    context: BuildContext::Path(context),
                    dockerfile: p.dockerfile.clone(),
                    no_cache: p.no_cache,
                    pull: p.pull,
                },
                &ctx.log,
            )
            .await
    }
    .await;

    if p.cleanup_after {
        match deps.workspaces.remove(&p.workspace_id) {
            Ok(true) => ctx.log.line("Workspace cleaned up").await,
            Ok(false) => {}
            Err(e) => warn!(workspace_id = %p.workspace_id, error = %e, "Workspace cleanup failed"),
        }
    }
    Ok(serde_json::to_value(built?)?)
}

pub(super) async fn delete_workspace(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: WorkspaceParams = parse_params(params)?;
    let deleted = deps.workspaces.remove(&p.workspace_id)?;
    ctx.log
        .line(format!("Workspace {} deleted={}", p.workspace_id, deleted))
        .await;
    Ok(json!({ "workspace_id": p.workspace_id, "deleted": deleted }))
}

#[derive(Debug, Deserialize)]
struct OverrideParams {
    workspace_id: String,
    #[serde(default)]
    compose_path: Option<String>,
}

pub(super) async fn clear_override(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: OverrideParams = parse_params(params)?;
    let compose_path = deps
        .workspaces
        .select_compose(&p.workspace_id, p.compose_path.as_deref())?;
    let target = deps.workspaces.override_path(&p.workspace_id, &compose_path)?;

    let deleted = match tokio::fs::remove_file(&target).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    ctx.log
        .line(format!("Compose override for {} deleted={}", compose_path, deleted))
        .await;
    Ok(json!({
        "workspace_id": p.workspace_id,
        "compose_path": compose_path,
        "deleted": deleted,
    }))
}

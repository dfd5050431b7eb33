//! Compose handlers: managed stacks and workspace compose files

use super::{ensure_within, parse_params, HandlerDeps, COMPOSE_TIMEOUT};
use crate::registry::HandlerContext;
use crate::runtime::ComposeInvocation;
use harbor_foundation::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Compose file names looked up in a stack directory, in order
const STACK_COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeAction {
    Up,
    Down,
    Restart,
    Pull,
}

impl ComposeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Restart => "restart",
            Self::Pull => "pull",
        }
    }

    /// Sub-command arguments
    pub fn args(&self, force_recreate: bool) -> Vec<String> {
        let mut args = vec![self.as_str().to_string()];
        if *self == Self::Up {
            args.push("-d".to_string());
            if force_recreate {
                args.push("--force-recreate".to_string());
            }
        }
        args
    }
}

fn validate_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = NAME_RE
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    if valid && name != "." && name != ".." {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid stack name: {:?}", name)))
    }
}

fn pick_compose_file(dir: &Path) -> Option<PathBuf> {
    STACK_COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

async fn run(
    deps: &HandlerDeps,
    ctx: &HandlerContext,
    invocation: ComposeInvocation,
    action: ComposeAction,
) -> Result<Value> {
    let output = deps
        .runtime
        .compose(&invocation, &ctx.log)
        .await?
        .ensure_success("docker compose")?;

    Ok(json!({
        "stack": invocation.project_name,
        "action": action.as_str(),
        "compose_file": invocation.compose_file.to_string_lossy(),
        "exit_code": output.exit_code,
        "output": output.tail(50),
    }))
}

#[derive(Debug, Deserialize)]
struct StackActionParams {
    name: String,
    action: ComposeAction,
    #[serde(default)]
    force_recreate: bool,
}

pub(super) async fn stack_action(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: StackActionParams = parse_params(params)?;
    validate_name(&p.name)?;

    let dir = deps.stacks_dir.join(&p.name);
    let compose_file = pick_compose_file(&dir)
        .ok_or_else(|| Error::NotFound(format!("Stack not found: {}", p.name)))?;

    let invocation = ComposeInvocation {
        project_name: p.name,
        compose_file,
        project_directory: None,
        env_files: Vec::new(),
        args: p.action.args(p.force_recreate),
        env: deps.proxy_env(),
        timeout: COMPOSE_TIMEOUT,
    };
    run(deps, &ctx, invocation, p.action).await
}

#[derive(Debug, Deserialize)]
struct WorkspaceComposeParams {
    project_name: String,
    compose_file: String,
    #[serde(default)]
    project_directory: Option<String>,
    action: ComposeAction,
    #[serde(default)]
    force_recreate: bool,
    #[serde(default)]
    env_files: Vec<String>,
}

pub(super) async fn workspace_action(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: WorkspaceComposeParams = parse_params(params)?;
    validate_name(&p.project_name)?;

    let root = deps.workspaces.root();
    let compose_file = ensure_within(root, Path::new(&p.compose_file))?;
    let project_directory = p
        .project_directory
        .as_deref()
        .map(|dir| ensure_within(root, Path::new(dir)))
        .transpose()?;
    let env_files = p
        .env_files
        .iter()
        .map(|file| ensure_within(root, Path::new(file)))
        .collect::<Result<Vec<_>>>()?;

    let invocation = ComposeInvocation {
        project_name: p.project_name,
        compose_file,
        project_directory,
        env_files,
        args: p.action.args(p.force_recreate),
        env: deps.proxy_env(),
        timeout: COMPOSE_TIMEOUT,
    };
    run(deps, &ctx, invocation, p.action).await
}

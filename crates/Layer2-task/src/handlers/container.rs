//! Container handlers

use super::{base_name, parse_params, HandlerDeps};
use crate::registry::HandlerContext;
use crate::runtime::LogsQuery;
use chrono::DateTime;
use harbor_foundation::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

fn default_tail() -> u64 {
    1000
}

/// Unix seconds from a number, a numeric string or an RFC 3339 timestamp
fn parse_instant(value: &Value, field: &str) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s.trim()).ok().map(|t| t.timestamp())),
        _ => None,
    };
    parsed.ok_or_else(|| Error::InvalidInput(format!("Invalid {}: {}", field, value)))
}

#[derive(Debug, Deserialize)]
struct ExportLogsParams {
    container_id: String,
    filename: String,
    #[serde(default = "default_tail")]
    tail: u64,
    #[serde(default)]
    since: Option<Value>,
    #[serde(default)]
    until: Option<Value>,
    #[serde(default)]
    search: Option<String>,
}

pub(super) async fn export_logs(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: ExportLogsParams = parse_params(params)?;
    let query = LogsQuery {
        tail: Some(p.tail),
        since: p.since.as_ref().map(|v| parse_instant(v, "since")).transpose()?,
        until: p.until.as_ref().map(|v| parse_instant(v, "until")).transpose()?,
        timestamps: true,
    };

    let mut text = deps.runtime.container_logs(&p.container_id, &query).await?;
    if let Some(search) = p.search.as_deref().filter(|s| !s.is_empty()) {
        text = text
            .lines()
            .filter(|line| line.contains(search))
            .collect::<Vec<_>>()
            .join("\n");
    }

    tokio::fs::create_dir_all(&deps.export_dir).await?;
    let output = deps.export_dir.join(base_name(&p.filename)?);
    tokio::fs::write(&output, text.as_bytes()).await?;
    let size = tokio::fs::metadata(&output).await?.len();

    ctx.log
        .line(format!("Exported logs of {} ({} bytes)", p.container_id, size))
        .await;
    Ok(json!({
        "file": output.to_string_lossy(),
        "size": size,
    }))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    container_id: String,
    #[serde(default)]
    force: bool,
}

pub(super) async fn remove(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: RemoveParams = parse_params(params)?;
    deps.runtime.remove_container(&p.container_id, p.force).await?;
    ctx.log
        .line(format!("Removed container {} (force={})", p.container_id, p.force))
        .await;
    Ok(json!({ "container_id": p.container_id, "removed": true }))
}

#[derive(Debug, Deserialize)]
struct ContainerParams {
    container_id: String,
}

pub(super) async fn kill(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: ContainerParams = parse_params(params)?;
    deps.runtime.kill_container(&p.container_id).await?;
    ctx.log.line(format!("Killed container {}", p.container_id)).await;
    Ok(json!({ "container_id": p.container_id, "killed": true }))
}

#[derive(Debug, Deserialize)]
struct BatchStopParams {
    container_ids: Vec<String>,
}

/// Stops each container independently; per-container failures are reported,
/// not raised
pub(super) async fn batch_stop(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: BatchStopParams = parse_params(params)?;
    if p.container_ids.is_empty() {
        return Err(Error::InvalidInput("container_ids is empty".to_string()));
    }

    let mut stopped = Vec::new();
    let mut failed = Vec::new();
    for id in p.container_ids {
        match deps.runtime.stop_container(&id).await {
            Ok(()) => {
                ctx.log.line(format!("Stopped {}", id)).await;
                stopped.push(id);
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "Batch stop failed for container");
                ctx.log.line(format!("Failed to stop {}: {}", id, e)).await;
                failed.push(json!({ "id": id, "error": e.to_string() }));
            }
        }
    }

    Ok(json!({ "stopped": stopped, "failed": failed }))
}

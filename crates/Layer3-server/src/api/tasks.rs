//! `/api/v1/tasks` handlers

use super::error::ApiError;
use super::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use harbor_foundation::{Confirmation, Error, CONFIRM_HEADER};
use harbor_task::{EnqueueRequest, ListQuery, TaskId, TaskStatus, TaskView};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::io::ReaderStream;

type ApiResult<T> = std::result::Result<T, ApiError>;

const FALLBACK_ACTOR: &str = "admin";

fn actor(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(state.actor_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(FALLBACK_ACTOR)
        .to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    confirm: bool,
}

fn confirmation(query: &ConfirmQuery, headers: &HeaderMap) -> Confirmation {
    let header = headers
        .get(CONFIRM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Confirmation::new(query.confirm, header)
}

fn parse_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::parse(raw).map_err(|_| ApiError(Error::NotFound(format!("Task {} not found", raw))))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    task_type: String,
    #[serde(default = "empty_object")]
    params: Value,
    #[serde(default)]
    resource_type: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
}

pub async fn enqueue(
    State(state): State<AppState>,
    Query(query): Query<ConfirmQuery>,
    headers: HeaderMap,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = EnqueueRequest {
        task_type: body.task_type,
        params: body.params,
        resource_type: body.resource_type,
        resource_id: body.resource_id,
        actor: actor(&state, &headers),
        confirmation: confirmation(&query, &headers),
    };
    let task_id = state.service.enqueue(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    limit: Option<usize>,
    status: Option<String>,
    task_type: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<TaskView>>> {
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let tasks = state
        .service
        .list(ListQuery {
            status,
            task_type: params.task_type.filter(|t| !t.is_empty()),
            limit: params.limit,
        })
        .await?;
    Ok(Json(tasks))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    tail: Option<usize>,
}

pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let text = state.service.logs(&id, params.tail).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryBody {
    #[serde(default)]
    params: Option<Map<String, Value>>,
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ConfirmQuery>,
    headers: HeaderMap,
    body: Option<Json<RetryBody>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = parse_id(&id)?;
    let overrides = body.and_then(|Json(b)| b.params);
    let outcome = state
        .service
        .retry(
            &id,
            &actor(&state, &headers),
            overrides,
            &confirmation(&query, &headers),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::to_value(outcome).map_err(Error::from)?)))
}

pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let artifact = state.service.download(&id).await?;
    let file = tokio::fs::File::open(&artifact.path).await.map_err(Error::from)?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        artifact.filename.replace(['"', '\\'], "_")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, artifact.size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "scheduler": state.service.scheduler().stats(),
    }))
}

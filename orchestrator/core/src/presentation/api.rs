// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! REST API
//!
//! Everything under `/api/v1` is dispatched through one axum fallback and
//! the [`RouteTable`], which keeps wildcard semantics (`*`, `**`) and the
//! endpoint listing in one place. JSON responses use the envelope
//! `{success, message?, data?}`; artifact downloads stream raw bytes.

use crate::application::agent_pool::{AgentPool, PoolError};
use crate::application::executor::TaskExecutor;
use crate::domain::agent::NodeStatus;
use crate::domain::blob::{BlobError, BlobId, ResultKind};
use crate::domain::task::TaskError;
use crate::infrastructure::agent_client::CHECKSUM_HEADER;
use crate::infrastructure::blob_cache::BlobCache;
use crate::infrastructure::log_buffer::LogBuffer;
use crate::infrastructure::system_probe::{NodeInfo, SystemProbe};
use crate::presentation::auth::BasicAuth;
use crate::presentation::router::{RouteError, RouteTable};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub const API_ROOT: &str = "/api/v1";
const JSON_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Info,
    Status,
    Log,
    TaskList,
    TaskGet,
    TaskCreate,
    TaskDelete,
    TaskConfigGet,
    TaskConfigSet,
    TaskRun,
    TaskStop,
    TaskFile,
    TaskStatus,
    TaskResult,
    TaskDetails,
    TaskMessages,
    AgentList,
    AgentConfig,
    AgentDelete,
}

fn route_table() -> Result<RouteTable<Endpoint>, RouteError> {
    use Endpoint::*;
    RouteTable::new()
        .route(Method::GET, "info", Info)?
        .route(Method::GET, "status", Status)?
        .route(Method::GET, "log", Log)?
        .route(Method::GET, "task", TaskList)?
        .route(Method::GET, "task/*", TaskGet)?
        .route(Method::PUT, "task/*", TaskCreate)?
        .route(Method::DELETE, "task/*", TaskDelete)?
        .route(Method::GET, "task/*/config", TaskConfigGet)?
        .route(Method::PUT, "task/*/config", TaskConfigSet)?
        .route(Method::PUT, "task/*/run", TaskRun)?
        .route(Method::PUT, "task/*/stop", TaskStop)?
        .route(Method::PUT, "task/*/file/**", TaskFile)?
        .route(Method::GET, "task/*/status", TaskStatus)?
        .route(Method::GET, "task/*/status/result/*", TaskResult)?
        .route(Method::GET, "task/*/details", TaskDetails)?
        .route(Method::GET, "task/*/messages", TaskMessages)?
        .route(Method::GET, "agent", AgentList)?
        .route(Method::PUT, "agent/*/config", AgentConfig)?
        .route(Method::DELETE, "agent/*", AgentDelete)
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

fn data<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        message: None,
        data: Some(data),
    })
    .into_response()
}

fn done(message: impl Into<String>) -> Response {
    Json(Envelope::<()> {
        success: true,
        message: Some(message.into()),
        data: None,
    })
    .into_response()
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        let body = Envelope::<()> {
            success: false,
            message: Some(self.to_string()),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound(_) => ApiError::NotFound(e.to_string()),
            TaskError::AlreadyExists(_) | TaskError::InvalidTransition { .. } | TaskError::Busy(_) => {
                ApiError::Conflict(e.to_string())
            }
            TaskError::Persistence(_) => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(_) => ApiError::NotFound(e.to_string()),
            BlobError::Pinned(_) => ApiError::Conflict(e.to_string()),
            BlobError::InvalidId(_)
            | BlobError::DigestMismatch { .. }
            | BlobError::SizeMismatch { .. }
            | BlobError::InvalidPath(_)
            | BlobError::Stream(_) => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NotFound(_) => ApiError::NotFound(e.to_string()),
            PoolError::InvalidName(_) | PoolError::NotLocal => ApiError::BadRequest(e.to_string()),
            PoolError::Registry(_) => ApiError::Internal(e.to_string()),
        }
    }
}

type ApiResult = Result<Response, ApiError>;

pub struct AppState {
    executor: Arc<TaskExecutor>,
    auth: BasicAuth,
    info: NodeInfo,
    probe: SystemProbe,
    logs: LogBuffer,
    pool: Option<Arc<AgentPool>>,
    routes: RouteTable<Endpoint>,
}

impl AppState {
    pub fn new(executor: Arc<TaskExecutor>, auth: BasicAuth, info: NodeInfo) -> Result<Self, RouteError> {
        let probe = SystemProbe::new(executor.blobs().root());
        Ok(Self {
            executor,
            auth,
            info,
            probe,
            logs: LogBuffer::default(),
            pool: None,
            routes: route_table()?,
        })
    }

    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_pool(mut self, pool: Arc<AgentPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn blobs(&self) -> &Arc<BlobCache> {
        self.executor.blobs()
    }

    fn pool(&self) -> Result<&Arc<AgentPool>, ApiError> {
        self.pool
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("Agent pool is only available on a manager".to_string()))
    }

    fn reject(&self, status: StatusCode, message: &str) -> Response {
        let body = json!({
            "success": false,
            "message": message,
            "endpoints": self.routes.endpoints(),
        });
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=\"renderfarm\""),
            );
        }
        response
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let authorization = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.auth.verify(authorization) {
        return state.reject(StatusCode::UNAUTHORIZED, "Authentication required");
    }

    let path = parts.uri.path();
    let Some(rest) = path.strip_prefix(API_ROOT) else {
        return state.reject(StatusCode::NOT_FOUND, &format!("Unknown endpoint {}", path));
    };
    let route = match state.routes.find(&parts.method, rest) {
        Ok(route) => route,
        Err(e) => return state.reject(StatusCode::NOT_FOUND, &e.to_string()),
    };
    let params: Vec<String> = route
        .params
        .iter()
        .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
        .collect();

    match handle(&state, *route.handler, &params, &parts.headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    state: &AppState,
    endpoint: Endpoint,
    params: &[String],
    headers: &HeaderMap,
    body: Body,
) -> ApiResult {
    let param = |i: usize| params.get(i).map(String::as_str).unwrap_or("");
    let executor = &state.executor;

    match endpoint {
        Endpoint::Info => Ok(data(&state.info)),
        Endpoint::Status => Ok(data(node_status(state))),
        Endpoint::Log => Ok(data(state.logs.lines())),
        Endpoint::TaskList => Ok(data(executor.task_list())),
        Endpoint::TaskGet => Ok(data(executor.task_get(param(0))?)),
        Endpoint::TaskCreate => task_create(state, param(0), body).await,
        Endpoint::TaskDelete => {
            executor.task_remove(param(0)).await?;
            Ok(done(format!("Task {} removed", param(0))))
        }
        Endpoint::TaskConfigGet => Ok(data(executor.task(param(0))?.read(|t| t.config()))),
        Endpoint::TaskConfigSet => {
            let values: Map<String, Value> = read_json(body).await?;
            Ok(data(executor.task_set_config(param(0), &values).await?))
        }
        Endpoint::TaskRun => {
            executor.task_run(param(0)).await?;
            Ok(done(format!("Task {} queued", param(0))))
        }
        Endpoint::TaskStop => {
            executor.task_stop(param(0)).await?;
            Ok(done(format!("Task {} stopping", param(0))))
        }
        Endpoint::TaskFile => task_file(state, param(0), param(1), headers, body).await,
        Endpoint::TaskStatus => Ok(data(executor.task(param(0))?.read(|t| t.status_view()))),
        Endpoint::TaskResult => task_result(state, param(0), param(1)).await,
        Endpoint::TaskDetails => Ok(data(
            executor.task(param(0))?.read(|t| t.execution_details.clone()),
        )),
        Endpoint::TaskMessages => Ok(data(executor.task(param(0))?.read(|t| t.messages().clone()))),
        Endpoint::AgentList => Ok(data(state.pool()?.summary())),
        Endpoint::AgentConfig => {
            #[derive(Deserialize)]
            struct AgentConfigBody {
                address: String,
            }
            let body: AgentConfigBody = read_json(body).await?;
            Ok(data(state.pool()?.register(param(0), &body.address).await?))
        }
        Endpoint::AgentDelete => {
            state.pool()?.remove(param(0)).await?;
            Ok(done(format!("Agent {} removed", param(0))))
        }
    }
}

fn node_status(state: &AppState) -> NodeStatus {
    let host = state.probe.sample();
    NodeStatus {
        load: host.load,
        memory_total: host.memory_total,
        memory_available: host.memory_available,
        disk_free: host.disk_free,
        cache_bytes: state.blobs().used_bytes(),
        running: state.executor.running_names(),
        terminating: state.executor.is_terminating(),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(body, JSON_BODY_LIMIT)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TaskCreateBody {
    config: Map<String, Value>,
    files: BTreeMap<String, BlobId>,
}

async fn task_create(state: &AppState, name: &str, body: Body) -> ApiResult {
    let body: TaskCreateBody = read_json(body).await?;
    let missing = state
        .executor
        .task_create(name, &body.config, &body.files)
        .await?;
    Ok(data(missing))
}

async fn task_file(state: &AppState, name: &str, path: &str, headers: &HeaderMap, body: Body) -> ApiResult {
    // The task may have been removed since the client listed its files
    state.executor.task(name)?;

    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("Content-Length header is required".to_string()))?;
    let id = headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{} header is required", CHECKSUM_HEADER)))?;
    let id = BlobId::parse(id)?;

    let meta = state
        .blobs()
        .store_stream(body.into_data_stream(), Some(&id), Some(size))
        .await?;
    state.executor.task_set_file(name, path, meta.id.clone()).await?;
    Ok(data(json!({ "path": path, "id": meta.id, "size": meta.size })))
}

async fn task_result(state: &AppState, name: &str, kind: &str) -> ApiResult {
    let kind = ResultKind::parse(kind)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown result kind '{}'", kind)))?;
    let id = state
        .executor
        .task(name)?
        .read(|t| t.status.result.get(kind).cloned())
        .ok_or_else(|| ApiError::NotFound(format!("Task {} has no {} yet", name, kind)))?;
    let (meta, file) = state
        .blobs()
        .open_blob(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Blob {} is no longer cached", id)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, meta.size)
        .header(CHECKSUM_HEADER, id.as_str())
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table_builds() {
        let routes = route_table().unwrap();
        let m = routes.find(&Method::GET, "/task/shot/status/result/render").unwrap();
        assert_eq!(*m.handler, Endpoint::TaskResult);
        assert_eq!(m.params, vec!["shot", "render"]);
        assert_eq!(routes.endpoints().len(), 19);
    }

    #[test]
    fn test_error_status_mapping() {
        let e: ApiError = TaskError::Busy("shot".to_string()).into();
        assert_eq!(e.status(), StatusCode::CONFLICT);
        let e: ApiError = TaskError::NotFound("shot".to_string()).into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
        let e: ApiError = TaskError::InvalidName("../x".to_string()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        let e: ApiError = BlobError::DigestMismatch {
            declared: BlobId::digest(b"a"),
            computed: BlobId::digest(b"b"),
        }
        .into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        let e: ApiError = PoolError::NotLocal.into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }
}

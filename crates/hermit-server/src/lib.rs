//! Hermit HTTP API
//!
//! Routes under `/v1` map one-to-one onto [`Hermit`] operations. Every
//! request carries `Authorization: Bearer <token>`; the token resolves to
//! the [`Principal`] that owns the workspaces it touches. Streams (command
//! output, interactive agent runs, workspace subscriptions) are delivered as
//! Server-Sent Events, one frame per [`hermit::StreamEvent`], and stop their
//! producer when the client disconnects.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use hermit::agent::{AgentMode, Decision, DecisionCollaborator, HttpDecider, Transcript};
use hermit::{
    AgentRequest, Authenticator, DecisionError, ErrorKind, EventChannel, ExecutionRequest,
    FileOperation, Hermit, HermitConfig, Principal, SandboxError, TaskId, Workspace,
    WorkspaceConfig, WorkspaceId, WorkspaceStatus,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The sandbox core.
    pub hermit: Arc<Hermit>,
    /// Resolves bearer tokens to principals.
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    /// Bundle the core with an authenticator.
    pub fn new(hermit: Arc<Hermit>, auth: Arc<dyn Authenticator>) -> Self {
        Self { hermit, auth }
    }
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/workspaces", post(create_workspace))
        .route(
            "/workspaces/{id}",
            get(get_workspace).delete(terminate_workspace),
        )
        .route(
            "/workspaces/{id}/commands",
            post(run_command).get(command_history),
        )
        .route(
            "/workspaces/{id}/files",
            get(read_file).put(write_file).delete(delete_file),
        )
        .route("/workspaces/{id}/files/batch", post(apply_batch))
        .route("/workspaces/{id}/stat", get(stat))
        .route("/workspaces/{id}/dir", get(list_dir))
        .route(
            "/workspaces/{id}/agent",
            post(start_agent).get(list_agent_tasks),
        )
        .route(
            "/workspaces/{id}/agent/{task}",
            get(agent_task).delete(cancel_agent),
        )
        .route("/workspaces/{id}/events", get(subscribe))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_principal,
        ))
        .with_state(state);

    Router::new().route("/health", get(health)).nest("/v1", v1)
}

/// The decision collaborator described by `config`: the HTTP adapter when a
/// URL is configured, otherwise one that fails every request.
pub fn decider(config: &HermitConfig) -> Arc<dyn DecisionCollaborator> {
    match &config.decision.url {
        Some(url) => Arc::new(HttpDecider::new(
            url.clone(),
            config.decision.model.clone(),
            config.agent.decision_timeout,
        )),
        None => Arc::new(Unconfigured),
    }
}

#[derive(Debug)]
struct Unconfigured;

#[async_trait]
impl DecisionCollaborator for Unconfigured {
    async fn next_action(&self, _transcript: &Transcript) -> Result<Decision, DecisionError> {
        Err(DecisionError::Request(
            "no decision endpoint configured".to_string(),
        ))
    }
}

/// A [`SandboxError`] rendered as `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::PathTraversal | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::SandboxBusy => StatusCode::CONFLICT,
        ErrorKind::SandboxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Decision => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence
        | ErrorKind::Aborted
        | ErrorKind::Cancelled
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let public = self.0.to_public();
        let status = status_for(public.kind);
        if status.is_server_error() {
            tracing::error!(kind = %public.kind, "request failed: {}", self.0);
        } else {
            tracing::debug!(kind = %public.kind, "request rejected: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": public }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_principal(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(hermit::auth::bearer_token)
        .ok_or(SandboxError::Unauthorized)?;
    let principal = state.auth.authenticate(token)?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, SandboxError> {
    raw.parse()
        .map_err(|_| SandboxError::NotFound(what.to_string()))
}

fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, SandboxError> {
    serde_json::from_slice(body)
        .map_err(|e| SandboxError::InvalidRequest(format!("malformed body: {e}")))
}

fn sse(channel: EventChannel) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(channel.map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .id(event.seq.to_string())
                .data(event.payload()),
        )
    }))
}

/// A workspace as shown to its owner. The host root stays private.
#[derive(Debug, Serialize)]
struct WorkspaceView {
    id: WorkspaceId,
    status: WorkspaceStatus,
    config: WorkspaceConfig,
    created_at: String,
}

impl From<Workspace> for WorkspaceView {
    fn from(workspace: Workspace) -> Self {
        Self {
            id: workspace.id,
            status: workspace.status,
            config: workspace.config,
            created_at: workspace.created_at.to_rfc3339(),
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct CreateWorkspaceBody {
    #[serde(default)]
    config: Option<WorkspaceConfig>,
}

async fn create_workspace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WorkspaceView>)> {
    let body: CreateWorkspaceBody = if body.is_empty() {
        CreateWorkspaceBody::default()
    } else {
        json_body(&body)?
    };
    let workspace = state
        .hermit
        .create_workspace(&principal, body.config)
        .await?;
    Ok((StatusCode::CREATED, Json(workspace.into())))
}

async fn get_workspace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkspaceView>> {
    let id = parse_id(&id, "workspace")?;
    let workspace = state.hermit.workspace(&principal, id).await?;
    Ok(Json(workspace.into()))
}

async fn terminate_workspace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id, "workspace")?;
    state.hermit.terminate_workspace(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct CommandQuery {
    #[serde(default)]
    stream: bool,
}

async fn run_command(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<CommandQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let request: ExecutionRequest = json_body(&body)?;
    if query.stream {
        let channel = state
            .hermit
            .stream_command(&principal, id, request)
            .await?;
        return Ok(sse(channel).into_response());
    }
    // Cancelled once this handler finishes or axum drops it on disconnect.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let result = state
        .hermit
        .run_command(&principal, id, request, &cancel)
        .await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn command_history(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let history = state
        .hermit
        .command_history(&principal, id, query.limit)
        .await?;
    Ok(Json(history).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn read_file(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let bytes = state.hermit.read_file(&principal, id, &query.path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn write_file(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let written = state
        .hermit
        .write_file(&principal, id, &query.path, &body)
        .await?;
    Ok(Json(serde_json::json!({ "bytes_written": written })).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id, "workspace")?;
    state
        .hermit
        .delete_file(&principal, id, &query.path)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stat(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let stat = state.hermit.stat(&principal, id, &query.path).await?;
    Ok(Json(stat).into_response())
}

async fn list_dir(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let entries = state.hermit.list_dir(&principal, id, &query.path).await?;
    Ok(Json(entries).into_response())
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    operations: Vec<FileOperation>,
}

async fn apply_batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let body: BatchBody = json_body(&body)?;
    let result = state
        .hermit
        .apply_batch(&principal, id, &body.operations)
        .await?;
    Ok(Json(result).into_response())
}

async fn start_agent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let request: AgentRequest = json_body(&body)?;
    match request.mode {
        AgentMode::Interactive => {
            let channel = state.hermit.run_agent(&principal, id, request).await?;
            Ok(sse(channel).into_response())
        }
        AgentMode::Autonomous { .. } => {
            let task_id = state.hermit.spawn_agent(&principal, id, request).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "task_id": task_id })),
            )
                .into_response())
        }
    }
}

async fn list_agent_tasks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let tasks = state.hermit.agent_tasks(&principal, id).await?;
    Ok(Json(tasks).into_response())
}

async fn agent_task(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, task)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let task: TaskId = parse_id(&task, "task")?;
    let record = state.hermit.agent_task(&principal, id, task).await?;
    Ok(Json(record).into_response())
}

async fn cancel_agent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, task)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id, "workspace")?;
    let task: TaskId = parse_id(&task, "task")?;
    state.hermit.cancel_agent(&principal, id, task).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn subscribe(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id, "workspace")?;
    let channel = state.hermit.subscribe(&principal, id).await?;
    Ok(sse(channel).into_response())
}

/// Resolve when the process receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

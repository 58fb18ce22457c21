use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::{EventQuery, NewEvent, ProcessStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::PanelConfig;
use crate::events::{now_millis, EventStore, SystemLogger};
use crate::hub::Hub;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::tasks::{TaskError, TaskRunner};

const DEFAULT_LOG_LINES: usize = 200;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<PanelConfig>,
    pub(crate) hub: Hub,
    pub(crate) supervisor: Supervisor,
    pub(crate) tasks: TaskRunner,
    pub(crate) syslog: SystemLogger,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/process/status", get(process_status))
        .route("/api/process/start", post(start_process))
        .route("/api/process/stop", post(stop_process))
        .route("/api/process/restart", post(restart_process))
        .route("/api/process/logs", get(process_logs))
        .route("/api/events", get(list_events))
        .route("/api/events/clear", post(clear_events))
        .route("/api/events/log", post(post_event))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/software/install", post(install_software))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

/// Failure body shared by every endpoint: `{"ok": false, "error": "..."}`.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "ok": false, "error": self.message })),
        )
            .into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::AlreadyRunning { .. } | SupervisorError::NotRunning => {
                StatusCode::CONFLICT
            }
            SupervisorError::BinaryNotFound { .. } | SupervisorError::Spawn(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let status = match &err {
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::AlreadyRunning(_) | TaskError::InvalidState { .. } => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "observers": state.hub.observer_count().await,
        "process": state.supervisor.status().await,
    }))
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    info!(
        event = "http.request",
        method = %method,
        uri = %uri,
        status = %response.status()
    );
    response
}

fn status_body(status: ProcessStatus) -> Json<Value> {
    Json(json!({ "ok": true, "status": status }))
}

async fn process_status(State(state): State<AppState>) -> Json<Value> {
    status_body(state.supervisor.status().await)
}

async fn start_process(State(state): State<AppState>) -> ApiResult {
    match state.supervisor.start().await {
        Ok(status) => {
            state
                .syslog
                .log("system", "process.start", "OpenClaw process started")
                .await;
            Ok(status_body(status))
        }
        Err(err) => {
            state
                .syslog
                .log(
                    "system",
                    "process.start.failed",
                    &format!("OpenClaw failed to start: {err}"),
                )
                .await;
            Err(err.into())
        }
    }
}

async fn stop_process(State(state): State<AppState>) -> ApiResult {
    let status = state.supervisor.stop().await?;
    state
        .syslog
        .log("system", "process.stop", "OpenClaw process stopped")
        .await;
    Ok(status_body(status))
}

async fn restart_process(State(state): State<AppState>) -> ApiResult {
    match state.supervisor.restart().await {
        Ok(status) => {
            state
                .syslog
                .log("system", "process.restart", "OpenClaw process restarted")
                .await;
            Ok(status_body(status))
        }
        Err(err) => {
            state
                .syslog
                .log(
                    "system",
                    "process.restart.failed",
                    &format!("OpenClaw failed to restart: {err}"),
                )
                .await;
            Err(err.into())
        }
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn process_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let lines = state
        .supervisor
        .logs(query.lines.unwrap_or(DEFAULT_LOG_LINES))
        .await;
    Json(json!({ "ok": true, "lines": lines }))
}

async fn list_events(State(state): State<AppState>, Query(query): Query<EventQuery>) -> ApiResult {
    let page = state.syslog.store().get_events(&query).await?;
    Ok(Json(json!({
        "ok": true,
        "events": page.events,
        "total": page.total,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

async fn clear_events(State(state): State<AppState>) -> ApiResult {
    state.syslog.store().clear_events().await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct PostEventRequest {
    #[serde(default)]
    source: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    detail: String,
}

/// Lets the agent and other local services append to the activity log.
async fn post_event(State(state): State<AppState>, Json(request): Json<PostEventRequest>) -> ApiResult {
    if request.summary.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "summary required"));
    }
    let source = non_empty_or(request.source, "openclaw");
    let kind = non_empty_or(request.kind, "openclaw.action");
    let event = NewEvent::new(now_millis(), source, kind, request.summary).with_detail(request.detail);
    let stored = state
        .syslog
        .record(event)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to store event"))?;
    Ok(Json(json!({ "ok": true, "id": stored.id })))
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "tasks": state.tasks.recent_tasks().await }))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = state
        .tasks
        .get_task(&id)
        .await
        .ok_or(TaskError::NotFound(id))?;
    Ok(Json(json!({ "ok": true, "task": task })))
}

#[derive(Deserialize)]
struct InstallRequest {
    #[serde(default)]
    software: String,
}

async fn install_software(
    State(state): State<AppState>,
    Json(request): Json<InstallRequest>,
) -> ApiResult {
    if request.software.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "software required"));
    }
    let Some(installer) = state.config.installer(&request.software) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unsupported software: {}", request.software),
        ));
    };
    let task = state
        .tasks
        .admit_task(&installer.name, &format!("install_{}", installer.software))
        .await?;
    let sudo_password = state
        .config
        .sudo_password
        .clone()
        .filter(|_| installer.sudo);
    info!(
        event = "install.queued",
        task_id = %task.id,
        software = %installer.software,
        sudo = sudo_password.is_some()
    );
    state
        .tasks
        .spawn_script(task.id.clone(), installer.script.clone(), sudo_password);
    Ok(Json(json!({ "ok": true, "taskId": task.id })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state.hub))
}

/// Forwards hub traffic to one observer until either side goes away. Hub
/// payloads are UTF-8 already (JSON frames or agent output lines).
async fn handle_ws(mut socket: WebSocket, hub: Hub) {
    let mut observer = hub.subscribe().await;
    loop {
        tokio::select! {
            message = observer.recv() => {
                let Some(message) = message else {
                    break;
                };
                let text = String::from_utf8_lossy(&message).into_owned();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    hub.unsubscribe(observer.id()).await;
}

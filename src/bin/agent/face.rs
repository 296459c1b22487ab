use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use webpilot::session::{SessionEvent, SessionId, SessionOptions, TaskRequest};
use webpilot::{AgentError, BrowserError, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

/// Maps library errors onto HTTP statuses.
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::SessionBusy(_) | AgentError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            AgentError::InvalidTask(_) => StatusCode::BAD_REQUEST,
            AgentError::Browser(BrowserError::SessionClosed(_)) => StatusCode::GONE,
            AgentError::Browser(_) | AgentError::Model(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(%status, "request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn to_sse_event(event: &SessionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(terminate_session))
        .route("/sessions/{id}/run", post(run_task))
        .route("/sessions/{id}/pause", post(pause_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/history", get(session_history))
        .route("/sessions/{id}/screenshot", get(session_screenshot))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(AppState { registry })
}

/// Bind `port`, falling back to the next nine ports if it is taken.
pub async fn bind(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("port {} unavailable: {}", p, e),
        }
    }
    anyhow::bail!(
        "could not bind to any port {}-{}; is another agent running?",
        port,
        port.saturating_add(9)
    )
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    registry: Arc<SessionRegistry>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("session API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// An empty body creates a session with default options.
async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let options: SessionOptions = if body.iter().all(u8::is_ascii_whitespace) {
        SessionOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AgentError::InvalidTask(format!("invalid session options: {}", e)))?
    };
    let info = state.registry.create(options).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.get(&SessionId(id))?))
}

async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.terminate(&SessionId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RunPayload {
    #[serde(alias = "task", alias = "command")]
    instructions: String,
    #[serde(default)]
    max_steps: Option<usize>,
}

/// Starts the run in the background; progress arrives on `/events`.
async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RunPayload>,
) -> ApiResult<impl IntoResponse> {
    let id = SessionId(id);
    let task = TaskRequest {
        instructions: payload.instructions,
        max_steps: payload.max_steps,
    };
    info!(session = %id, "run requested: {}", task.instructions);
    let _run = state.registry.spawn_run(&id, task)?;
    Ok((StatusCode::ACCEPTED, Json(state.registry.get(&id)?)))
}

async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.pause(&SessionId(id))?))
}

async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.resume(&SessionId(id))?))
}

async fn session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.history(&SessionId(id))?))
}

async fn session_screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let png = state.registry.screenshot(&SessionId(id)).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<SessionEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(&event))),
            Err(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

//! HTTP gateway.
//!
//! Exposes the session bridge as an NDJSON streaming endpoint plus the
//! abort and answer side channels, and serves recovered conversation
//! history for the web UI.

pub mod error;

pub use error::ApiError;

use crate::agent::{Agent, ClaudeCliAgent};
use crate::chat::{Answer, BridgeSettings, ChatRequest, SessionBridge};
use crate::config::{Config, HistoryConfig};
use crate::history::{self, HistoryError};
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

/// Where conversation logs and the agent's project list live.
#[derive(Debug, Clone)]
pub struct HistorySource {
    pub projects_dir: PathBuf,
    pub agent_config_path: PathBuf,
    pub preview_chars: usize,
}

impl HistorySource {
    pub fn from_config(config: &HistoryConfig) -> Result<Self> {
        Ok(Self {
            projects_dir: config.resolved_projects_dir()?,
            agent_config_path: config.resolved_agent_config_path()?,
            preview_chars: config.preview_chars,
        })
    }
}

pub struct AppState {
    pub bridge: SessionBridge,
    pub history: HistorySource,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(bridge: SessionBridge, history: HistorySource) -> SharedState {
        Arc::new(Self { bridge, history })
    }
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/abort/{request_id}", post(abort))
        .route("/api/answer/{request_id}", post(answer))
        .route("/api/projects", get(projects))
        .route("/api/projects/{project}/histories", get(histories))
        .route(
            "/api/projects/{project}/histories/{session_id}",
            get(conversation),
        )
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeRequests": state.bridge.active_requests(),
    }))
}

async fn chat(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    if request.request_id.trim().is_empty() {
        return Err(ApiError::BadRequest("requestId must not be empty".into()));
    }

    let request_id = request.request_id.clone();
    let events = state.bridge.open(request)?;
    tracing::info!("Chat request {request_id} opened");

    let body = ReceiverStream::new(events)
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_ndjson())));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::Internal(e.into()))
}

async fn abort(
    State(state): State<SharedState>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.bridge.abort(&request_id) {
        return Err(ApiError::NotFound("Request not found or already completed".into()));
    }
    tracing::info!("Chat request {request_id} aborted");
    Ok(Json(json!({
        "success": true,
        "message": "Request aborted",
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerBody {
    question_id: String,
    answers: Answer,
}

async fn answer(
    State(state): State<SharedState>,
    Path(request_id): Path<String>,
    payload: Result<Json<AnswerBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    if !state
        .bridge
        .answer(&request_id, &body.question_id, body.answers)
    {
        return Err(ApiError::NotFound("No pending question with that id".into()));
    }
    Ok(Json(json!({ "success": true })))
}

async fn projects(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let source = state.history.clone();
    let projects = blocking(move || {
        history::list_projects(&source.agent_config_path, &source.projects_dir)
    })
    .await?;
    Ok(Json(json!({ "projects": projects })))
}

async fn histories(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let source = state.history.clone();
    let conversations = blocking(move || {
        history::list_conversations(&source.projects_dir, &project, source.preview_chars)
    })
    .await?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn conversation(
    State(state): State<SharedState>,
    Path((project, session_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let source = state.history.clone();
    let session = session_id.clone();
    let loaded = blocking(move || {
        history::load_conversation(
            &source.projects_dir,
            &project,
            &session,
            source.preview_chars,
        )
    })
    .await;

    match loaded {
        Ok(history) => Ok(Json(history).into_response()),
        Err(ApiError::NotFound(_)) => Err(ApiError::ConversationNotFound { session_id }),
        Err(e) => Err(e),
    }
}

/// Run filesystem-bound history work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, HistoryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("history task failed")?
        .map_err(ApiError::from)
}

/// Bind the listener and serve until Ctrl+C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let agent = ClaudeCliAgent::from_config(&config.agent)?;
    tracing::info!("Using {} at {}", agent.name(), agent.cli_path().display());

    let bridge = SessionBridge::new(Arc::new(agent), BridgeSettings::from_config(&config.agent));
    let history = HistorySource::from_config(&config.history)?;
    tracing::info!("Reading history from {}", history.projects_dir.display());

    let app = router(AppState::new(bridge, history));

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("chatrelay listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;
    tracing::info!("chatrelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

//! HTTP API routes for the cockpit.
//!
//! Observers normally live on the `/ws` event stream; these endpoints cover
//! status panels, scripted clients and the legacy web page's REST calls.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_types::{ChatMessage, Mode, TaskRunInfo};

pub mod websocket;

use crate::app_state::AppState;
use crate::dispatcher::Dispatched;
use crate::supervisor::TaskError;

#[derive(Clone)]
pub struct ApiState {
    pub app_state: AppState,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::ws_handler))
        .route("/api/status", get(get_status))
        .route("/api/history", get(get_history))
        .route("/api/history/clear", post(clear_history))
        .route("/api/task", get(get_task))
        .route("/api/task/cancel", post(cancel_task))
        .route("/api/message", post(send_message))
        .route("/api/mode", post(switch_mode))
}

pub async fn health_check(State(_state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "autoglm-cockpit",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub mode: Mode,
    pub mode_display: String,
    pub task: TaskRunInfo,
    pub device: String,
    pub chat_model: String,
    pub observers: usize,
    pub active_chats: usize,
    pub history_len: usize,
}

pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let app = &state.app_state;
    let mode = app.mode().current();
    Json(StatusResponse {
        mode,
        mode_display: mode.display_name().to_string(),
        task: app.supervisor().status(),
        device: app.config().device.address(),
        chat_model: app.dispatcher().chat_model().to_string(),
        observers: app.relay().subscriber_count(),
        active_chats: app.dispatcher().active_chats(),
        history_len: app.history().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
}

pub async fn get_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(HistoryResponse {
        messages: state.app_state.dispatcher().history(query.limit),
    })
}

pub async fn clear_history(State(state): State<ApiState>) -> impl IntoResponse {
    state.app_state.dispatcher().clear_history();
    Json(json!({ "status": "cleared" }))
}

pub async fn get_task(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.app_state.supervisor().status())
}

pub async fn cancel_task(State(state): State<ApiState>) -> impl IntoResponse {
    match state.app_state.dispatcher().cancel_task().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "task": state.app_state.supervisor().status() })),
        )
            .into_response(),
        Err(e) => task_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

pub async fn send_message(
    State(state): State<ApiState>,
    Json(request): Json<MessageRequest>,
) -> impl IntoResponse {
    match state
        .app_state
        .dispatcher()
        .handle_message(&request.message)
        .await
    {
        Dispatched::Ignored => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message is empty" })),
        )
            .into_response(),
        Dispatched::Chat { request_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "chat", "request_id": request_id })),
        )
            .into_response(),
        Dispatched::TaskStarted { task_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "task_started", "task_id": task_id })),
        )
            .into_response(),
        Dispatched::Rejected(e) => task_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
}

pub async fn switch_mode(
    State(state): State<ApiState>,
    Json(request): Json<ModeRequest>,
) -> impl IntoResponse {
    let changed = state
        .app_state
        .dispatcher()
        .handle_mode_switch(request.mode);
    Json(json!({ "mode": request.mode, "changed": changed }))
}

fn task_error_response(error: &TaskError) -> axum::response::Response {
    let status = match error {
        TaskError::Busy => StatusCode::CONFLICT,
        TaskError::EnvironmentInvalid(_) | TaskError::SpawnFailed(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TaskError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::EmptyInstruction => StatusCode::BAD_REQUEST,
        TaskError::ProcessFailed { .. } | TaskError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

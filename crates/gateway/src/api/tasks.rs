//! Task status endpoints.
//!
//! Status queries expose `has_unread = terminal ∧ ¬viewed`, letting clients
//! badge sessions with unseen results.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn all_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tasks.all_status())
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.status(&session_id) {
        Some(execution) => Json(json!({
            "task_id": execution.task_id,
            "status": execution.status,
            "has_unread": execution.has_unread(),
            "started_at": execution.started_at,
            "completed_at": execution.completed_at,
            "error": execution.error,
            "event_count": execution.event_count,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no task state for session: {session_id}")})),
        )
            .into_response(),
    }
}

pub async fn mark_viewed(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    state.tasks.mark_viewed(&session_id);
    Json(json!({"ok": true}))
}

pub async fn interrupt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let interrupted = state.tasks.interrupt(&session_id).await;
    Json(json!({"interrupted": interrupted}))
}

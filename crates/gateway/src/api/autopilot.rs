//! Autopilot REST endpoints — create an autonomous session, start its run
//! in the background, inspect or cancel it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use ov_autopilot::models::{SessionOptions, TaskDefinition, WorkerConfig};
use ov_domain::error::Error;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAutopilotRequest {
    pub worker: WorkerConfig,
    #[serde(default)]
    pub checker: Option<WorkerConfig>,
    pub task: TaskDefinition,
    #[serde(default)]
    pub session: SessionOptions,
    /// Initial input payload; defaults to the task's declared inputs.
    #[serde(default)]
    pub input: Option<Value>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateAutopilotRequest>,
) -> impl IntoResponse {
    match state.autopilot.create_session(
        body.task,
        body.worker,
        body.checker,
        body.input,
        body.session,
    ) {
        Ok(session) => (
            StatusCode::CREATED,
            Json(json!({"session_id": session.session_id, "status": session.status})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.autopilot.session(&session_id) {
        Ok(session) => Json(json!(session)).into_response(),
        Err(Error::SessionNotFound(_)) => not_found(&session_id),
        Err(e) => internal_error(e),
    }
}

/// Start the cycle loop as a background task and return immediately.
/// Progress is observable through `GET .../:session_id`.
pub async fn run_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.autopilot.session(&session_id) {
        Ok(session) if session.status.is_terminal() => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": format!("session already {:?}", session.status).to_lowercase()})),
            )
                .into_response();
        }
        Ok(_) => {}
        Err(Error::SessionNotFound(_)) => return not_found(&session_id),
        Err(e) => return internal_error(e),
    }

    let autopilot = state.autopilot.clone();
    let sid = session_id.clone();
    tokio::spawn(async move {
        match autopilot.run(&sid).await {
            Ok(session) => {
                tracing::info!(session_id = %sid, status = ?session.status, "autopilot run finished");
            }
            Err(e) => {
                tracing::error!(session_id = %sid, error = %e, "autopilot run failed");
            }
        }
    });

    Json(json!({"session_id": session_id, "started": true})).into_response()
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.autopilot.cancel(&session_id) {
        Ok(session) => Json(json!({"session_id": session.session_id, "status": session.status}))
            .into_response(),
        Err(Error::SessionNotFound(_)) => not_found(&session_id),
        Err(e) => internal_error(e),
    }
}

fn not_found(session_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("autopilot session not found: {session_id}")})),
    )
        .into_response()
}

fn internal_error(e: Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

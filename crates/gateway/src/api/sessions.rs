//! Session REST endpoints.
//!
//! - `GET    /v1/sessions`     — metadata summaries, newest first
//! - `POST   /v1/sessions`     — create (optional title)
//! - `GET    /v1/sessions/:id` — full session including transcript
//! - `DELETE /v1/sessions/:id` — delete; closes the managed client and
//!   clears task state

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use ov_domain::error::Error;
use ov_sessions::DEFAULT_TITLE;

use crate::state::AppState;

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.list())
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let title = body.title.unwrap_or_else(|| DEFAULT_TITLE.to_owned());
    match state.sessions.create(title) {
        Ok(session) => (StatusCode::CREATED, Json(json!(session))).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.load(&session_id) {
        Ok(session) => Json(json!(session)).into_response(),
        Err(Error::SessionNotFound(_)) => not_found(&session_id),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    // Close the live client and drop task state before removing the file.
    state.manager.close_session(&session_id).await;
    state.tasks.clear(&session_id);

    match state.sessions.delete(&session_id) {
        Ok(true) => Json(json!({"deleted": true})).into_response(),
        Ok(false) => not_found(&session_id),
        Err(e) => internal_error(e),
    }
}

fn not_found(session_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("session not found: {session_id}")})),
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

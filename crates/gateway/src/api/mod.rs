//! HTTP/WebSocket surface. Handlers are thin: they translate transport
//! frames into runtime calls and runtime errors into status codes.

pub mod autopilot;
pub mod sessions;
pub mod tasks;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        // ── Health ────────────────────────────────────────────────────
        .route("/healthz", get(|| async { "ok" }))
        // ── Sessions ──────────────────────────────────────────────────
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/v1/sessions/:session_id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        // ── Tasks ─────────────────────────────────────────────────────
        .route("/v1/tasks/status", get(tasks::all_status))
        .route("/v1/sessions/:session_id/task", get(tasks::session_status))
        .route(
            "/v1/sessions/:session_id/task/viewed",
            post(tasks::mark_viewed),
        )
        .route(
            "/v1/sessions/:session_id/task/interrupt",
            post(tasks::interrupt),
        )
        // ── Multiplexed event channel ─────────────────────────────────
        .route("/ws/agent", get(ws::ws_handler))
        // ── Autopilot ─────────────────────────────────────────────────
        .route("/v1/autopilot/sessions", post(autopilot::create_session))
        .route(
            "/v1/autopilot/sessions/:session_id",
            get(autopilot::get_session),
        )
        .route(
            "/v1/autopilot/sessions/:session_id/run",
            post(autopilot::run_session),
        )
        .route(
            "/v1/autopilot/sessions/:session_id/cancel",
            post(autopilot::cancel_session),
        )
}

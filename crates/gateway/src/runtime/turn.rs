//! Turn glue — ties the durable session store, the session manager, and the
//! task runner together for one interactive turn.
//!
//! [`run_session_turn`] persists the user message, obtains (or recreates)
//! the managed client session, wraps the manager's event stream with
//! transcript assembly, and hands the wrapped stream to the task runner.
//! The background task outlives any client connection.

use futures_util::StreamExt;
use serde_json::Value;

use ov_domain::config::PermissionMode;
use ov_domain::error::{Error, Result};
use ov_domain::event::EventType;
use ov_sessions::{SessionMessage, TurnAssembler};

use crate::state::AppState;

use super::manager::SessionRequest;
use super::EventStream;

/// Input to one interactive turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub prompt: String,
    /// Endpoint override; falls back to the session's last endpoint.
    pub endpoint: Option<String>,
    /// Model override; falls back to the session's last model.
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub cwd: Option<String>,
}

/// Start one turn as a background task. Returns the task id.
///
/// Fails with [`Error::SessionBusy`] when a task is already running and
/// with [`Error::SessionNotFound`] when the durable session does not exist
/// (the caller decides whether to create one first).
pub async fn run_session_turn(state: &AppState, req: TurnRequest) -> Result<String> {
    if state.tasks.is_running(&req.session_id) {
        return Err(Error::SessionBusy(req.session_id));
    }

    let stored = state.sessions.load(&req.session_id)?;
    let endpoint = req.endpoint.clone().or(stored.last_endpoint_name.clone());
    let model = req.model.clone().or(stored.last_model_name.clone());

    let managed = state
        .manager
        .get_or_create(SessionRequest {
            session_id: req.session_id.clone(),
            endpoint: endpoint.clone(),
            model: model.clone(),
            resume_token: stored.resume_token.clone(),
            cwd: req.cwd.clone(),
            permission_mode: req.permission_mode,
        })
        .await;

    let inner = state
        .manager
        .stream(managed, req.prompt.clone(), req.permission_mode);
    let stream = finalize_stream(
        state.clone(),
        req.session_id.clone(),
        req.prompt.clone(),
        endpoint,
        model,
        req.permission_mode,
        inner,
    );

    state.tasks.start(&req.session_id, &req.prompt, stream)
}

/// Wrap the manager's stream: tee every event into a [`TurnAssembler`],
/// capture the external session token, and persist the assistant message
/// plus the session's config snapshot. Persistence happens before the
/// terminal event is yielded, so once a subscriber (or the status query)
/// observes the turn as finished, the transcript is already durable.
fn finalize_stream(
    state: AppState,
    session_id: String,
    prompt: String,
    endpoint: Option<String>,
    model: Option<String>,
    permission_mode: Option<PermissionMode>,
    mut inner: EventStream,
) -> EventStream {
    Box::pin(async_stream::stream! {
        // The user message lands in the transcript first; this runs only
        // once the task runner has actually accepted the turn.
        if let Err(e) = state
            .sessions
            .append_message(&session_id, SessionMessage::user(&prompt))
        {
            tracing::warn!(session_id = %session_id, error = %e, "failed to persist user message");
        }

        let mut assembler = Some(TurnAssembler::new());
        let mut token: Option<String> = None;

        while let Some(event) = inner.next().await {
            if event.kind == EventType::System {
                if let Some(t) = event.content.get("session_token").and_then(Value::as_str) {
                    token = Some(t.to_owned());
                }
            }
            if let Some(assembler) = assembler.as_mut() {
                assembler.apply(&event);
            }
            if event.kind.is_terminal() {
                if let Some(assembler) = assembler.take() {
                    persist_turn(
                        &state,
                        &session_id,
                        assembler,
                        &token,
                        &endpoint,
                        &model,
                        permission_mode,
                    );
                }
            }
            yield event;
        }

        // A stream that ended without a terminal event still persists what
        // it produced.
        if let Some(assembler) = assembler.take() {
            persist_turn(
                &state,
                &session_id,
                assembler,
                &token,
                &endpoint,
                &model,
                permission_mode,
            );
        }
    })
}

fn persist_turn(
    state: &AppState,
    session_id: &str,
    assembler: TurnAssembler,
    token: &Option<String>,
    endpoint: &Option<String>,
    model: &Option<String>,
    permission_mode: Option<PermissionMode>,
) {
    if let Some(message) = assembler.into_message() {
        if let Err(e) = state.sessions.append_message(session_id, message) {
            tracing::warn!(session_id, error = %e, "failed to persist assistant message");
        }
    }
    let snapshot = state.sessions.update(session_id, |session| {
        if token.is_some() {
            session.resume_token = token.clone();
        }
        session.last_endpoint_name = endpoint.clone();
        session.last_model_name = model.clone();
        if let Some(mode) = permission_mode {
            session.last_permission_mode = Some(mode);
        }
    });
    if let Err(e) = snapshot {
        tracing::warn!(session_id, error = %e, "failed to persist session snapshot");
    }
}

//! Event multiplexer — one duplex JSON channel per client, many sessions.
//!
//! Inbound frames: `query`, `subscribe`, `unsubscribe`, `user_response`,
//! `permission_response`. Outbound frames are buffered events (with
//! `metadata.session_id` set) plus `task_started` confirmations and error
//! reports. Subscriptions replay the cached prefix first, so a reconnecting
//! client resumes exactly where the event log stands.
//!
//! Disconnecting cancels this client's subscriptions only — background
//! tasks keep running; that decoupling is the point.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ov_domain::config::PermissionMode;
use ov_domain::error::Error;

use crate::runtime::{run_session_turn, TurnRequest};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Query {
        session_id: String,
        prompt: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        permission_mode: Option<PermissionMode>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    UserResponse {
        request_id: String,
        answers: Value,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-client connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One connected client: an outbound queue plus its per-session
/// subscription forwarders. Transport-agnostic so the frame protocol can be
/// tested without a socket.
pub struct ClientConn {
    state: AppState,
    out: mpsc::Sender<Value>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl ClientConn {
    pub fn new(state: AppState, out: mpsc::Sender<Value>) -> Self {
        Self {
            state,
            out,
            subscriptions: HashMap::new(),
        }
    }

    /// Parse and dispatch one inbound text frame. A malformed frame is
    /// reported on the channel and never closes it.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => {
                self.send_error(None, "invalid_frame", &format!("invalid frame: {e}"))
                    .await;
            }
        }
    }

    async fn dispatch(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Query {
                session_id,
                prompt,
                endpoint,
                model,
                permission_mode,
                cwd,
            } => {
                let request = TurnRequest {
                    session_id: session_id.clone(),
                    prompt,
                    endpoint,
                    model,
                    permission_mode,
                    cwd,
                };
                match run_session_turn(&self.state, request).await {
                    Ok(task_id) => {
                        self.send(json!({
                            "type": "task_started",
                            "content": {"task_id": task_id},
                            "metadata": {"session_id": session_id},
                        }))
                        .await;
                        self.subscribe(&session_id).await;
                    }
                    Err(Error::SessionBusy(_)) => {
                        self.send_error(
                            Some(&session_id),
                            "session_busy",
                            "session already has a running task",
                        )
                        .await;
                    }
                    Err(Error::SessionNotFound(_)) => {
                        self.send_error(
                            Some(&session_id),
                            "session_not_found",
                            &format!("session not found: {session_id}"),
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "query failed");
                        self.send_error(Some(&session_id), "stream_error", &e.to_string())
                            .await;
                    }
                }
            }
            InboundFrame::Subscribe { session_id } => {
                self.subscribe(&session_id).await;
            }
            InboundFrame::Unsubscribe { session_id } => {
                if let Some(handle) = self.subscriptions.remove(&session_id) {
                    handle.abort();
                    tracing::debug!(session_id, "unsubscribed");
                }
            }
            InboundFrame::UserResponse {
                request_id,
                answers,
            } => {
                self.state.gate.respond(&request_id, answers);
            }
            InboundFrame::PermissionResponse {
                request_id,
                approved,
            } => {
                self.state.gate.respond_permission(&request_id, approved);
            }
        }
    }

    /// Register a subscription: replay the cached prefix, then forward live
    /// events until the terminal event. Subscribing implicitly marks the
    /// session viewed; re-subscribing replaces the previous forwarder.
    async fn subscribe(&mut self, session_id: &str) {
        if let Some(previous) = self.subscriptions.remove(session_id) {
            previous.abort();
        }

        let (cached, live) = self.state.tasks.subscribe(session_id);
        let out = self.out.clone();
        let sid = session_id.to_owned();

        let handle = tokio::spawn(async move {
            for event in cached {
                let value = match serde_json::to_value(&event) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if out.send(value).await.is_err() {
                    return;
                }
            }

            let Some(mut rx) = live else {
                return;
            };
            while let Some(event) = rx.recv().await {
                let terminal = event.kind().is_terminal();
                let value = match serde_json::to_value(&event) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if out.send(value).await.is_err() {
                    return;
                }
                if terminal {
                    break;
                }
            }
            tracing::debug!(session_id = %sid, "subscription stream ended");
        });

        self.subscriptions.insert(session_id.to_owned(), handle);
        tracing::debug!(session_id, "subscribed");
    }

    async fn send(&self, value: Value) {
        let _ = self.out.send(value).await;
    }

    async fn send_error(&self, session_id: Option<&str>, code: &str, message: &str) {
        let mut metadata = json!({"code": code});
        if let Some(session_id) = session_id {
            metadata["session_id"] = json!(session_id);
        }
        self.send(json!({
            "type": "error",
            "content": message,
            "metadata": metadata,
        }))
        .await;
    }

    /// Tear down this client's subscriptions. Background tasks are left
    /// running.
    pub fn disconnect(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_loop(state, socket))
}

async fn client_loop(state: AppState, socket: WebSocket) {
    tracing::info!("client connected");
    let (mut sink, mut source) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if sink.send(Message::Text(value.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ClientConn::new(state, out_tx);
    while let Some(Ok(message)) = source.next().await {
        match message {
            Message::Text(text) => conn.handle_text(&text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn.disconnect();
    writer.abort();
    tracing::info!("client disconnected");
}
